use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::models::MailModel;

/// A change notification for the UI, emitted once per committed mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub object_class: &'static str,
    pub objects: Vec<Value>,
}

impl Delta {
    pub fn persist<T: MailModel>(model: &T) -> Result<Delta, serde_json::Error> {
        Ok(Delta {
            kind: "persist",
            object_class: T::TABLE,
            objects: vec![serde_json::to_value(model)?],
        })
    }

    pub fn unpersist<T: MailModel>(model: &T) -> Result<Delta, serde_json::Error> {
        Ok(Delta {
            kind: "unpersist",
            object_class: T::TABLE,
            objects: vec![serde_json::to_value(model)?],
        })
    }
}

/// Observer registry shared by every store instance in the process.
/// Production registers exactly one sink: the UI channel writer.
#[derive(Clone, Default)]
pub struct Observers {
    sinks: Arc<Mutex<Vec<flume::Sender<Delta>>>>,
}

impl Observers {
    pub fn new() -> Observers {
        Observers::default()
    }

    pub fn add_observer(&self, sink: flume::Sender<Delta>) {
        self.sinks.lock().unwrap().push(sink);
    }

    pub fn emit(&self, delta: Delta) {
        let sinks = self.sinks.lock().unwrap();
        for sink in sinks.iter() {
            // A closed sink just means the channel went away; the orphan
            // watchdog owns shutdown, not the store.
            let _ = sink.send(delta.clone());
        }
    }
}
