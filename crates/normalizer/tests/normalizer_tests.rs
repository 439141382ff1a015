use normalizer::{normalize, Normalizer, METADATA_FIELDS, NUMERIC_FIELDS};
use serde_json::{json, Map, Value};
use types::TelemetryValue;

#[test]
fn empty_markers_become_none_for_every_field() {
    let markers = [json!(""), json!("NA"), json!("N/A"), Value::Null];
    for field in NUMERIC_FIELDS.iter().chain(METADATA_FIELDS) {
        for marker in &markers {
            assert_eq!(normalize(field, marker), None, "{field} {marker}");
        }
    }
}

#[test]
fn whole_number_strings_become_integers() {
    assert_eq!(normalize("acpower", &json!("120.0")), Some(TelemetryValue::Integer(120)));
    assert_eq!(normalize("soc", &json!(" 85 ")), Some(TelemetryValue::Integer(85)));
    assert_eq!(
        normalize("feedinpower", &json!("-500")),
        Some(TelemetryValue::Integer(-500))
    );
}

#[test]
fn fractional_strings_stay_fractional() {
    assert_eq!(
        normalize("battemper", &json!("21.5")),
        Some(TelemetryValue::Float(21.5))
    );
}

#[test]
fn numeric_input_passes_through() {
    assert_eq!(normalize("batPower", &json!(-2000)), Some(TelemetryValue::Integer(-2000)));
    assert_eq!(normalize("battemper", &json!(19.25)), Some(TelemetryValue::Float(19.25)));
}

#[test]
fn unparseable_numeric_input_degrades_to_none() {
    assert_eq!(normalize("acpower", &json!("   ")), None);
    assert_eq!(normalize("acpower", &json!("12W")), None);
    assert_eq!(normalize("acpower", &json!("NaN")), None);
    assert_eq!(normalize("acpower", &json!("inf")), None);
    assert_eq!(normalize("acpower", &json!(true)), None);
    assert_eq!(normalize("acpower", &json!({"value": 1})), None);
}

#[test]
fn metadata_passes_through_untouched() {
    assert_eq!(
        normalize("uploadTime", &json!("2024-05-01 10:00:00")),
        Some(TelemetryValue::Text("2024-05-01 10:00:00".to_string()))
    );
    assert_eq!(
        normalize("sn", &json!(" sn-with-space ")),
        Some(TelemetryValue::Text(" sn-with-space ".to_string()))
    );
    assert_eq!(normalize("other", &json!(7)), Some(TelemetryValue::Integer(7)));
}

#[test]
fn body_tracks_every_field_and_drops_unknown_keys() {
    let body = as_map(json!({
        "acpower": "1500",
        "soc": 50,
        "batPower": "NA",
        "unknown": "ignored",
        "inverterSn": "INV1",
    }));

    let record = Normalizer::default().normalize_body(&body);
    assert_eq!(record.len(), NUMERIC_FIELDS.len() + METADATA_FIELDS.len());
    assert_eq!(record.get("acpower"), Some(&TelemetryValue::Integer(1500)));
    assert_eq!(record.get("batPower"), None);
    assert!(record.contains_key("battemper"));
    assert!(!record.contains_key("unknown"));
    assert_eq!(record.get("inverterSn"), Some(&TelemetryValue::Text("INV1".to_string())));
}

#[test]
fn metadata_merge_only_fills_gaps() {
    let normalizer = Normalizer::default();
    let body = as_map(json!({"sn": "BODY-SN", "uploadTime": ""}));
    let envelope = as_map(json!({"sn": "ENV-SN", "uploadTime": "2024-05-01 10:00:00", "code": 0}));

    let mut record = normalizer.normalize_body(&body);
    normalizer.merge_metadata(&mut record, &envelope);

    assert_eq!(record.get("sn"), Some(&TelemetryValue::Text("BODY-SN".to_string())));
    assert_eq!(
        record.get("uploadTime"),
        Some(&TelemetryValue::Text("2024-05-01 10:00:00".to_string()))
    );
    assert!(!record.contains_key("code"));
}

#[test]
fn custom_field_sets_are_honoured() {
    let normalizer = Normalizer::with_fields(["yieldtoday"], ["sn"]);
    assert!(normalizer.is_numeric("yieldtoday"));
    assert!(!normalizer.is_numeric("acpower"));
    assert_eq!(normalizer.tracked_fields(), ["yieldtoday".to_string(), "sn".to_string()]);
    assert_eq!(
        normalizer.normalize("acpower", &json!("12")),
        Some(TelemetryValue::Text("12".to_string()))
    );
}

fn as_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}
