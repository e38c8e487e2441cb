//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use derive_new::new;
use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

use crate::adjacency::AdjacencyDatabase;
use crate::prefix::{PrefixDatabase, PrefixKey};

// Key marker of adjacency databases: "adj:<node>".
pub const ADJ_KEY_MARKER: &str = "adj:";

// Versioned value envelope carried by the key-value transport. The
// payload is the serialized database; versions increase monotonically
// per originator.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Value {
    pub version: i64,
    pub originator_node: String,
    pub payload: Vec<u8>,
}

// One batched publication from the transport.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Publication {
    pub area: String,
    pub key_vals: BTreeMap<String, Value>,
    pub expired_keys: Vec<String>,
}

// Everything the decision engine receives on its kv-store stream.
#[derive(Clone, Debug, EnumAsInner)]
pub enum KvStoreUpdate {
    Publication(Publication),
    // The transport finished the initial sync of one area.
    InitialSync { area: String },
    // The local node's own adjacency keys have been synced; link events
    // from here on are live and their propagation time is measured.
    AdjacencyDbSynced,
}

// Parsed form of a publication key. Keys with unknown markers parse to
// `None` and are ignored without error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KvKey {
    Adjacency(String),
    Prefix(PrefixKey),
}

// ===== impl Value =====

impl Value {
    pub fn adjacency(version: i64, db: &AdjacencyDatabase) -> Value {
        Value::new(
            version,
            db.node.clone(),
            serde_json::to_vec(db).unwrap(),
        )
    }

    pub fn prefix(version: i64, db: &PrefixDatabase) -> Value {
        Value::new(
            version,
            db.node.clone(),
            serde_json::to_vec(db).unwrap(),
        )
    }

    pub fn decode_adjacency(
        &self,
    ) -> Result<AdjacencyDatabase, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub fn decode_prefix(&self) -> Result<PrefixDatabase, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

// ===== impl Publication =====

impl Publication {
    pub fn new(area: &str) -> Publication {
        Publication {
            area: area.to_owned(),
            key_vals: Default::default(),
            expired_keys: Default::default(),
        }
    }
}

// ===== impl KvKey =====

impl KvKey {
    pub fn parse(key: &str) -> Option<KvKey> {
        if let Some(node) = key.strip_prefix(ADJ_KEY_MARKER) {
            if node.is_empty() {
                return None;
            }
            return Some(KvKey::Adjacency(node.to_owned()));
        }
        PrefixKey::parse(key).map(KvKey::Prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parsing() {
        assert_eq!(
            KvKey::parse("adj:node-1"),
            Some(KvKey::Adjacency("node-1".to_owned()))
        );
        let key = KvKey::parse("prefix:2:0:10.1.1.1/32").unwrap();
        assert!(matches!(key, KvKey::Prefix(_)));

        // Unknown markers are ignored without error.
        assert_eq!(KvKey::parse("adj2:1"), None);
        assert_eq!(KvKey::parse("adji2:2"), None);
        assert_eq!(KvKey::parse("adj:"), None);
        assert_eq!(KvKey::parse("something-else"), None);
    }

    #[test]
    fn test_adjacency_value_roundtrip() {
        let db = AdjacencyDatabase::new("1", 1, vec![]);
        let value = Value::adjacency(1, &db);
        assert_eq!(value.originator_node, "1");
        assert_eq!(value.decode_adjacency().unwrap(), db);
    }

    #[test]
    fn test_prefix_value_roundtrip() {
        use crate::prefix::{PrefixEntry, PrefixType};

        let entry = PrefixEntry::new(
            "10.1.0.0/16".parse().unwrap(),
            PrefixType::Bgp,
        );
        let db = PrefixDatabase {
            node: "2".to_owned(),
            prefix_entries: vec![entry],
            perf_events: None,
            delete_prefix: false,
        };
        let value = Value::prefix(1, &db);
        assert_eq!(value.decode_prefix().unwrap(), db);
    }

    #[test]
    fn test_corrupt_payload() {
        let value = Value::new(1, "1".to_owned(), b"not json".to_vec());
        assert!(value.decode_adjacency().is_err());
        assert!(value.decode_prefix().is_err());
    }
}
