use crate::reading::{parse_timestamp, Reading, SensorType};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use std::fs;
use std::path::PathBuf;

/// Latest value per (sensor_type, location), one small JSON file each, readable by
/// the display front-end without touching the database.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub value: f64,
    pub timestamp: NaiveDateTime,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create snapshot dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// `<type>_<location>.json`. The type never contains a raw `_` and both parts
    /// percent-encode anything outside their safe set, so distinct keys always map
    /// to distinct files. Plain keys like `moisture`/`jade_plant` stay readable.
    pub fn path_for(&self, sensor_type: &SensorType, location: &str) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.json",
            encode_component(sensor_type.as_str(), false),
            encode_component(location, true)
        ))
    }

    /// Replaces the record for the reading's key. The body goes to a sibling temp
    /// file first and is renamed over the visible one, so readers never see a torn
    /// write.
    pub fn put(&self, reading: &Reading) -> Result<PathBuf> {
        let path = self.path_for(&reading.sensor_type, &reading.location);
        let tmp = path.with_extension("json.tmp");

        let mut record = Map::new();
        record.insert(
            reading.sensor_type.as_str().to_string(),
            Value::from(reading.value),
        );
        record.insert("timestamp".to_string(), Value::from(reading.timestamp_text()));
        let body = serde_json::to_vec(&Value::Object(record))?;

        fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(path)
    }

    pub fn get(&self, sensor_type: &SensorType, location: &str) -> Result<Option<Snapshot>> {
        let path = self.path_for(sensor_type, location);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let decoded: Map<String, Value> = serde_json::from_slice(&raw)
            .with_context(|| format!("parse {}", path.display()))?;

        let value = decoded
            .get(sensor_type.as_str())
            .and_then(Value::as_f64)
            .with_context(|| format!("{} has no `{}` value", path.display(), sensor_type))?;
        let timestamp = decoded
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .with_context(|| format!("{} has no valid timestamp", path.display()))?;
        Ok(Some(Snapshot { value, timestamp }))
    }
}

fn encode_component(raw: &str, allow_underscore: bool) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || (allow_underscore && byte == b'_') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn at(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).unwrap()
    }

    #[test]
    fn put_then_get_returns_latest_value() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();

        let first = Reading::new(SensorType::Moisture, "jade_plant", 410.0, at("2025-03-01 08:00:00"));
        store.put(&first).unwrap();
        let second = Reading::new(SensorType::Moisture, "jade_plant", 388.5, at("2025-03-01 08:05:00"));
        store.put(&second).unwrap();

        let snapshot = store
            .get(&SensorType::Moisture, "jade_plant")
            .unwrap()
            .expect("snapshot");
        assert_eq!(snapshot.value, 388.5);
        assert_eq!(snapshot.timestamp, at("2025-03-01 08:05:00"));
    }

    #[test]
    fn record_uses_sensor_type_as_value_key() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let reading = Reading::new(SensorType::Temperature, "livingroom", 72.5, at("2025-03-01 09:00:00"));
        let path = store.put(&reading).unwrap();

        assert_eq!(path, dir.path().join("temperature_livingroom.json"));
        let raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["temperature"], 72.5);
        assert_eq!(raw["timestamp"], "2025-03-01 09:00:00");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_key_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        assert!(store.get(&SensorType::Humidity, "attic").unwrap().is_none());
    }

    #[test]
    fn path_components_are_encoded() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let path = store.path_for(&SensorType::Other("co2".into()), "../garage door");
        assert_eq!(path, dir.path().join("co2_%2E%2E%2Fgarage%20door.json"));
        assert_eq!(
            store.path_for(&SensorType::Moisture, "jade_plant"),
            dir.path().join("moisture_jade_plant.json")
        );
    }

    #[test]
    fn lookalike_keys_keep_separate_records() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let ts = at("2025-03-01 08:00:00");

        store
            .put(&Reading::new(SensorType::Temperature, "living_room", 70.0, ts))
            .unwrap();
        store
            .put(&Reading::new(SensorType::Temperature, "living.room", 99.0, ts))
            .unwrap();
        store
            .put(&Reading::new(SensorType::Moisture, "jade_plant", 410.0, ts))
            .unwrap();
        store
            .put(&Reading::new(SensorType::Other("moisture_jade".into()), "plant", 1.0, ts))
            .unwrap();

        let get = |sensor_type: &SensorType, location: &str| {
            store.get(sensor_type, location).unwrap().expect("snapshot").value
        };
        assert_eq!(get(&SensorType::Temperature, "living_room"), 70.0);
        assert_eq!(get(&SensorType::Temperature, "living.room"), 99.0);
        assert_eq!(get(&SensorType::Moisture, "jade_plant"), 410.0);
        assert_eq!(get(&SensorType::Other("moisture_jade".into()), "plant"), 1.0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 4);
    }
}
