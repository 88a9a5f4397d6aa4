//! Guest metadata service payloads.

use firepool_core::metadata::{METADATA_ADDRESS, METADATA_PINNED_VERSION};
use serde_json::{json, Map, Value};

/// Key split out of the document into the top-level `user-data` entry.
const USER_DATA_KEY: &str = "user-data";

/// Build the document served to the guest.
///
/// Every key except `user-data` goes under `meta-data`; the same version
/// document is published as `latest` and under the pinned dated version.
#[must_use]
pub fn build_document(metadata: &Map<String, Value>) -> Value {
    let mut meta_data = Map::new();
    let mut user_data = None;
    for (key, value) in metadata {
        if key == USER_DATA_KEY {
            user_data = Some(value.clone());
        } else {
            meta_data.insert(key.clone(), value.clone());
        }
    }

    let mut version = Map::new();
    version.insert("meta-data".to_owned(), Value::Object(meta_data));
    if let Some(user_data) = user_data {
        version.insert(USER_DATA_KEY.to_owned(), user_data);
    }
    let version = Value::Object(version);

    let mut document = Map::new();
    document.insert("latest".to_owned(), version.clone());
    document.insert(METADATA_PINNED_VERSION.to_owned(), version);
    Value::Object(document)
}

/// Metadata service configuration attaching it to `iface_id`.
#[must_use]
pub fn service_config(iface_id: &str) -> Value {
    json!({
        "version": "V1",
        "network_interfaces": [iface_id],
        "ipv4_address": METADATA_ADDRESS.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("instance-id".to_owned(), json!("default-abc"));
        m.insert("firepool".to_owned(), json!({"runner_name": "r1"}));
        m.insert("user-data".to_owned(), json!("#cloud-config\n"));
        m
    }

    #[test]
    fn user_data_is_split_out_of_meta_data() {
        let doc = build_document(&metadata());
        assert_eq!(doc["latest"]["meta-data"]["instance-id"], "default-abc");
        assert_eq!(doc["latest"]["meta-data"]["firepool"]["runner_name"], "r1");
        assert!(doc["latest"]["meta-data"].get("user-data").is_none());
        assert_eq!(doc["latest"]["user-data"], "#cloud-config\n");
    }

    #[test]
    fn pinned_version_mirrors_latest() {
        let doc = build_document(&metadata());
        assert_eq!(doc["latest"], doc["2009-04-04"]);
    }

    #[test]
    fn no_user_data_key_without_user_data() {
        let doc = build_document(&Map::new());
        assert!(doc["latest"].get("user-data").is_none());
        assert_eq!(doc["latest"]["meta-data"], json!({}));
    }

    #[test]
    fn service_config_uses_link_local_address() {
        let cfg = service_config("eth0");
        assert_eq!(cfg["ipv4_address"], "169.254.169.254");
        assert_eq!(cfg["network_interfaces"][0], "eth0");
    }
}
