//! Trimmed analogue of `common/health`'s `HealthHandle`/`HealthRegistry`,
//! scoped to what the metadata loop and transact session need: a way to
//! say "I am still making progress" that an embedding service's health
//! probe can watch for staleness.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    Starting,
    HealthyUntil,
    Stalled,
}

#[derive(Clone)]
pub struct LivenessHandle {
    component: String,
    deadline: Duration,
    state: Arc<RwLock<HashMap<String, Instant>>>,
}

impl LivenessHandle {
    pub fn report_healthy(&self) {
        let until = Instant::now() + self.deadline;
        match self.state.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), until);
            }
            Err(_) => warn!("poisoned liveness registry mutex"),
        }
    }
}

#[derive(Clone)]
pub struct LivenessRegistry {
    state: Arc<RwLock<HashMap<String, Instant>>>,
}

impl Default for LivenessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> LivenessHandle {
        let component = component.into();
        let handle = LivenessHandle {
            component: component.clone(),
            deadline,
            state: self.state.clone(),
        };
        handle.report_healthy();
        handle
    }

    pub fn status(&self, component: &str) -> ComponentStatus {
        let Ok(map) = self.state.read() else {
            return ComponentStatus::Stalled;
        };
        match map.get(component) {
            None => ComponentStatus::Starting,
            Some(until) if *until > Instant::now() => ComponentStatus::HealthyUntil,
            Some(_) => ComponentStatus::Stalled,
        }
    }
}
