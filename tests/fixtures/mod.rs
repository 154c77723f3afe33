//! Test fixtures for batch submissions

#![allow(dead_code)]

/// Image identifiers in submission order: `specimen-001.jpg`, `specimen-002.jpg`, ...
pub fn item_ids(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("specimen-{i:03}.jpg")).collect()
}

/// A provider reply in the envelope the annotation service returns.
pub const PROVIDER_REPLY: &str = r#"{
    "result": {
        "description": "{\"annotations\": [{\"label\": \"Quercus robur\", \"confidence\": 0.93, \"bbox\": [0.1, 0.1, 0.4, 0.7]}, {\"label\": \"Lucanus cervus\", \"confidence\": 0.71}], \"model\": \"vision-large\"}"
    }
}"#;

/// A provider reply whose description is not the requested JSON.
pub const PROVIDER_REPLY_PROSE: &str = r#"{
    "result": {
        "description": "I can see an oak tree and a beetle."
    }
}"#;
