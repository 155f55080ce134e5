//! Operator log: leveled messages buffered locally and flushed to the
//! monitor cluster, with configurable routing.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use ferrofs_types::Result;

use crate::subsystems::{ClogEntry, MonitorClient};

/// Where operator-log lines go, beyond the local tracing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClogRouting {
    pub to_monitors: bool,
    pub to_syslog: bool,
    pub channel: String,
    pub priority: String,
}

impl Default for ClogRouting {
    fn default() -> Self {
        Self {
            to_monitors: true,
            to_syslog: false,
            channel: "cluster".into(),
            priority: "info".into(),
        }
    }
}

/// The operator log channel. Entries are buffered until `flush` pushes
/// them to the monitor.
pub struct OperatorLog {
    monc: Arc<dyn MonitorClient>,
    pending: Mutex<VecDeque<ClogEntry>>,
    routing: Mutex<ClogRouting>,
}

impl OperatorLog {
    pub fn new(monc: Arc<dyn MonitorClient>) -> Self {
        Self {
            monc,
            pending: Mutex::new(VecDeque::new()),
            routing: Mutex::new(ClogRouting::default()),
        }
    }

    pub fn update_config(&self, routing: ClogRouting) {
        *self.routing.lock() = routing;
    }

    pub fn routing(&self) -> ClogRouting {
        self.routing.lock().clone()
    }

    fn log(&self, level: &str, message: String) {
        let routing = self.routing.lock();
        match level {
            "error" => tracing::error!(target: "clog", channel = %routing.channel, "{}", message),
            "warn" => tracing::warn!(target: "clog", channel = %routing.channel, "{}", message),
            _ => tracing::info!(target: "clog", channel = %routing.channel, "{}", message),
        }
        if routing.to_monitors {
            self.pending.lock().push_back(ClogEntry {
                level: level.into(),
                message,
            });
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log("info", message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log("warn", message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log("error", message.into());
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Push all buffered entries to the monitor. Failed pushes are
    /// requeued for the next flush.
    pub async fn flush(&self) -> Result<()> {
        let entries: Vec<ClogEntry> = {
            let mut pending = self.pending.lock();
            pending.drain(..).collect()
        };
        if entries.is_empty() {
            return Ok(());
        }
        match self.monc.send_log(entries.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut pending = self.pending.lock();
                for entry in entries.into_iter().rev() {
                    pending.push_front(entry);
                }
                Err(e)
            }
        }
    }
}
