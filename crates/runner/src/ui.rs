//! Ausgabe während eines Laufs.
//!
//! [`RunUI`] abstrahiert die Ausgabe, damit die gleiche Logik mit Text,
//! ohne Ausgabe (JSON-Modus) und in Tests läuft. Bei Fleet-Läufen senden die
//! Host-Tasks ihre Events über einen Channel an die eigentliche UI.

use tokio::sync::mpsc;

use crate::reconcile::Plan;
use crate::report::{HostReport, OperationResult, OperationStatus};

// ============================================================================
// RunUI Trait
// ============================================================================

pub trait RunUI {
    /// Plan für einen Host steht fest
    fn on_host_start(&mut self, host: &str, plan: &Plan);

    /// Eine Operation ist abgeschlossen (auch übersprungen oder nur geplant)
    fn on_operation_finished(&mut self, host: &str, result: &OperationResult);

    fn on_warning(&mut self, host: &str, message: &str);

    /// Host ist fertig
    fn on_host_complete(&mut self, report: &HostReport);
}

// ============================================================================
// HeadlessUI - println!-basierte Ausgabe
// ============================================================================

pub struct HeadlessUI;

impl RunUI for HeadlessUI {
    fn on_host_start(&mut self, host: &str, plan: &Plan) {
        if plan.is_empty() {
            println!("\x1b[1;34m▶ {}\x1b[0m: in sync", host);
        } else {
            println!("\x1b[1;34m▶ {}\x1b[0m: {} operation(s)", host, plan.len());
        }
    }

    fn on_operation_finished(&mut self, host: &str, result: &OperationResult) {
        let secs = result.duration.as_secs_f64();
        match result.status {
            OperationStatus::Applied => {
                println!("\x1b[1;32m✓ [{}] {} ({:.1}s)\x1b[0m", host, result.description, secs)
            }
            OperationStatus::Unchanged => {
                println!("= [{}] {} (already up to date)", host, result.description)
            }
            OperationStatus::Planned => println!("~ [{}] {}", host, result.description),
            OperationStatus::Failed => eprintln!(
                "\x1b[1;31m✗ [{}] {} failed: {}\x1b[0m",
                host,
                result.description,
                result.error.as_deref().unwrap_or("unknown error")
            ),
            OperationStatus::SkippedDependencyFailed => {
                eprintln!("\x1b[33m- [{}] {} skipped\x1b[0m", host, result.description)
            }
            OperationStatus::Cancelled => {
                eprintln!("\x1b[33m- [{}] {} cancelled\x1b[0m", host, result.description)
            }
        }
    }

    fn on_warning(&mut self, host: &str, message: &str) {
        eprintln!("\x1b[33m! [{}] {}\x1b[0m", host, message);
    }

    fn on_host_complete(&mut self, report: &HostReport) {
        if let Some(error) = &report.validation_error {
            eprintln!("\x1b[1;31m✗ {}: invalid declaration: {}\x1b[0m", report.host, error);
            return;
        }
        for drift in &report.verification {
            eprintln!("\x1b[1;31m✗ [{}] still drifting: {}\x1b[0m", report.host, drift);
        }
        if let Some(info) = &report.info {
            for c in &info.containers {
                println!("  {} {} ({}, {:?})", c.name, c.image, c.status, c.health);
            }
        }
        println!(
            "  {}: {} ({:.1}s)",
            report.host,
            report.summary,
            report.duration.as_secs_f64()
        );
    }
}

/// Keine Ausgabe, z.B. wenn der Report als JSON geschrieben wird.
pub struct QuietUI;

impl RunUI for QuietUI {
    fn on_host_start(&mut self, _host: &str, _plan: &Plan) {}
    fn on_operation_finished(&mut self, _host: &str, _result: &OperationResult) {}
    fn on_warning(&mut self, _host: &str, _message: &str) {}
    fn on_host_complete(&mut self, _report: &HostReport) {}
}

// ============================================================================
// ChannelUI - leitet Events aus Host-Tasks weiter
// ============================================================================

#[derive(Debug, Clone)]
pub enum UiEvent {
    HostStart { host: String, plan: Plan },
    OperationFinished { host: String, result: OperationResult },
    Warning { host: String, message: String },
    HostComplete(Box<HostReport>),
}

impl UiEvent {
    /// Gibt das Event an `ui` weiter.
    pub fn dispatch<U: RunUI + ?Sized>(self, ui: &mut U) {
        match self {
            Self::HostStart { host, plan } => ui.on_host_start(&host, &plan),
            Self::OperationFinished { host, result } => ui.on_operation_finished(&host, &result),
            Self::Warning { host, message } => ui.on_warning(&host, &message),
            Self::HostComplete(report) => ui.on_host_complete(&report),
        }
    }
}

pub struct ChannelUI {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelUI {
    pub fn new(tx: mpsc::UnboundedSender<UiEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: UiEvent) {
        // Empfänger weg: Ausgabe ist egal, der Lauf geht weiter
        let _ = self.tx.send(event);
    }
}

impl RunUI for ChannelUI {
    fn on_host_start(&mut self, host: &str, plan: &Plan) {
        self.send(UiEvent::HostStart {
            host: host.to_string(),
            plan: plan.clone(),
        });
    }

    fn on_operation_finished(&mut self, host: &str, result: &OperationResult) {
        self.send(UiEvent::OperationFinished {
            host: host.to_string(),
            result: result.clone(),
        });
    }

    fn on_warning(&mut self, host: &str, message: &str) {
        self.send(UiEvent::Warning {
            host: host.to_string(),
            message: message.to_string(),
        });
    }

    fn on_host_complete(&mut self, report: &HostReport) {
        self.send(UiEvent::HostComplete(Box::new(report.clone())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockUI;

    #[test]
    fn test_channel_ui_forwards_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = ChannelUI::new(tx);
        channel.on_host_start("web01", &Plan::new("web01"));
        channel.on_warning("web01", "pruning skipped");
        channel.on_host_complete(&HostReport::new("web01", false));
        drop(channel);

        let mut ui = MockUI::new();
        while let Ok(event) = rx.try_recv() {
            event.dispatch(&mut ui);
        }

        assert_eq!(
            ui.events,
            vec!["host_start:web01:0", "warning:web01:pruning skipped", "host_complete:web01"]
        );
    }
}
