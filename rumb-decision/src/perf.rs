//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use chrono::Utc;
use derive_new::new;
use serde::{Deserialize, Serialize};

// Single event of a performance trace.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PerfEvent {
    pub node_name: String,
    pub event_descr: String,
    pub unix_ts: i64,
}

// Ordered trail of performance events, carried along with updates so that
// end-to-end convergence time can be measured across modules.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PerfEvents {
    pub events: Vec<PerfEvent>,
}

// ===== impl PerfEvents =====

impl PerfEvents {
    // Appends an event stamped with the current wall-clock time.
    pub fn push_event(&mut self, node_name: &str, event_descr: &str) {
        self.events.push(PerfEvent::new(
            node_name.to_owned(),
            event_descr.to_owned(),
            Utc::now().timestamp_millis(),
        ));
    }

    // Timestamp of the oldest event in the trail.
    pub fn first_ts(&self) -> Option<i64> {
        self.events.first().map(|event| event.unix_ts)
    }
}
