use std::time::Duration;

use bytesize::ByteSize;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

/// Messages a scheduled run emits for whoever presents them to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Simulation {
        scenario_name: String,
        browsers: Vec<String>,
        file_count: usize,
        total_size: u64,
    },
    Completed {
        scenario_name: String,
        deleted_files: usize,
        deleted_size_mb: f64,
        #[serde(with = "duration_secs")]
        duration: Duration,
    },
    Error {
        scenario_name: String,
        message: String,
    },
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::Simulation {
                scenario_name,
                browsers,
                file_count,
                total_size,
            } => info!(
                "[simulation] {}: {} files ({}) across {}",
                scenario_name,
                file_count,
                ByteSize(total_size),
                browsers.join(", ")
            ),
            Notification::Completed {
                scenario_name,
                deleted_files,
                deleted_size_mb,
                duration,
            } => info!(
                "{} finished: {} files, {:.2} MB in {:.1}s",
                scenario_name,
                deleted_files,
                deleted_size_mb,
                duration.as_secs_f64()
            ),
            Notification::Error {
                scenario_name,
                message,
            } => error!("{} failed: {}", scenario_name, message),
        }
    }
}

/// Forwards notifications over a channel; a closed receiver is not an error.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelNotifier { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            warn!("Notification dropped: receiver closed");
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
