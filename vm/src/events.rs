//! Translation of the service's asynchronous lifecycle events into the
//! stable callback contract.
//!
//! The service delivers raw numeric codes on its own thread. The translator
//! normalizes them into the closed [`ErrorCode`] / [`StopReason`] taxonomy,
//! guards the terminal notification with a one-shot latch, and queues events
//! for a dispatcher task so callback code never runs on the service's
//! delivery thread or under any of the VM's locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use haven_service::{codes, VmEventListener};

/// Receiver of lifecycle events for one [`VirtualMachine`].
///
/// Events arrive on a dispatcher task owned by the machine, never on the
/// caller's thread and never while the machine's state lock is held. Without
/// a registered callback, events are silently dropped.
///
/// [`VirtualMachine`]: crate::VirtualMachine
pub trait VmCallback: Send + Sync + 'static {
    fn on_payload_started(&self) {}
    fn on_payload_ready(&self) {}
    fn on_payload_finished(&self, _exit_code: i32) {}
    fn on_error(&self, _error: ErrorCode, _message: &str) {}
    /// Terminal for the current run; delivered exactly once per run.
    fn on_stopped(&self, _reason: StopReason) {}
}

/// Non-terminal fault while the VM keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unknown,
    PayloadVerificationFailed,
    PayloadChanged,
    InvalidPayloadConfig,
}

impl ErrorCode {
    pub(crate) fn from_raw(code: i32) -> Self {
        match code {
            codes::ERROR_PAYLOAD_VERIFICATION_FAILED => Self::PayloadVerificationFailed,
            codes::ERROR_PAYLOAD_CHANGED => Self::PayloadChanged,
            codes::ERROR_INVALID_PAYLOAD_CONFIG => Self::InvalidPayloadConfig,
            _ => Self::Unknown,
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The service infrastructure failed; the VM itself may have been fine.
    ServiceInfrastructureDied,
    Killed,
    Unknown,
    ShutdownRequested,
    StartFailed,
    Reboot,
    Crash,
    FirmwareKeyMismatch,
    FirmwareInstanceChanged,
    FailedToConnectToService,
    PayloadChanged,
    PayloadVerificationFailed,
    InvalidPayloadConfig,
    UnknownRuntimeError,
    Hangup,
}

impl StopReason {
    pub(crate) fn from_raw(reason: i32) -> Self {
        match reason {
            codes::DEATH_INFRASTRUCTURE_ERROR => Self::ServiceInfrastructureDied,
            codes::DEATH_KILLED => Self::Killed,
            codes::DEATH_SHUTDOWN => Self::ShutdownRequested,
            codes::DEATH_START_FAILED => Self::StartFailed,
            codes::DEATH_REBOOT => Self::Reboot,
            codes::DEATH_CRASH => Self::Crash,
            codes::DEATH_FIRMWARE_KEY_MISMATCH => Self::FirmwareKeyMismatch,
            codes::DEATH_FIRMWARE_INSTANCE_CHANGED => Self::FirmwareInstanceChanged,
            codes::DEATH_FAILED_TO_CONNECT_TO_SERVICE => Self::FailedToConnectToService,
            codes::DEATH_PAYLOAD_CHANGED => Self::PayloadChanged,
            codes::DEATH_PAYLOAD_VERIFICATION_FAILED => Self::PayloadVerificationFailed,
            codes::DEATH_INVALID_PAYLOAD_CONFIG => Self::InvalidPayloadConfig,
            codes::DEATH_UNKNOWN_RUNTIME_ERROR => Self::UnknownRuntimeError,
            codes::DEATH_HANGUP => Self::Hangup,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug)]
enum VmEvent {
    PayloadStarted,
    PayloadReady,
    PayloadFinished(i32),
    Error(ErrorCode, String),
    Stopped(StopReason),
}

/// The registered callback, behind its own lock. No other lock is ever taken
/// while this one is held, and it is released before the callback runs.
#[derive(Default)]
pub(crate) struct CallbackSlot {
    callback: Mutex<Option<Arc<dyn VmCallback>>>,
}

impl CallbackSlot {
    pub fn set(&self, callback: Arc<dyn VmCallback>) {
        *self.callback.lock().expect("callback lock poisoned") = Some(callback);
    }

    pub fn clear(&self) {
        self.callback.lock().expect("callback lock poisoned").take();
    }

    fn current(&self) -> Option<Arc<dyn VmCallback>> {
        self.callback.lock().expect("callback lock poisoned").clone()
    }
}

/// Listener registered with the service for one run.
pub(crate) struct CallbackTranslator {
    tx: mpsc::UnboundedSender<VmEvent>,
    stopped: AtomicBool,
}

impl CallbackTranslator {
    /// Returns the translator plus the dispatcher task draining its queue
    /// into `slot`. The task ends when the last sender is dropped.
    pub fn spawn(slot: Arc<CallbackSlot>) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(callback) = slot.current() else {
                    debug!(?event, "no callback registered, dropping event");
                    continue;
                };
                match event {
                    VmEvent::PayloadStarted => callback.on_payload_started(),
                    VmEvent::PayloadReady => callback.on_payload_ready(),
                    VmEvent::PayloadFinished(exit_code) => {
                        callback.on_payload_finished(exit_code)
                    }
                    VmEvent::Error(code, message) => callback.on_error(code, &message),
                    VmEvent::Stopped(reason) => callback.on_stopped(reason),
                }
            }
        });
        let translator = Arc::new(Self {
            tx,
            stopped: AtomicBool::new(false),
        });
        (translator, dispatcher)
    }

    /// Queues the terminal notification, at most once per run. Both the
    /// service's death event and a local stop funnel through here, so a race
    /// between them still yields exactly one notification.
    pub fn report_stopped(&self, reason: StopReason) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.tx.send(VmEvent::Stopped(reason));
        }
    }
}

impl VmEventListener for CallbackTranslator {
    fn on_payload_started(&self) {
        let _ = self.tx.send(VmEvent::PayloadStarted);
    }

    fn on_payload_ready(&self) {
        let _ = self.tx.send(VmEvent::PayloadReady);
    }

    fn on_payload_finished(&self, exit_code: i32) {
        let _ = self.tx.send(VmEvent::PayloadFinished(exit_code));
    }

    fn on_error(&self, code: i32, message: String) {
        let _ = self
            .tx
            .send(VmEvent::Error(ErrorCode::from_raw(code), message));
    }

    fn on_died(&self, reason: i32) {
        self.report_stopped(StopReason::from_raw(reason));
    }

    fn on_service_died(&self) {
        self.report_stopped(StopReason::ServiceInfrastructureDied);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        stops: Mutex<Vec<StopReason>>,
        errors: Mutex<Vec<(ErrorCode, String)>>,
        done: tokio::sync::Notify,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                stops: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                done: tokio::sync::Notify::new(),
            })
        }
    }

    impl VmCallback for Recorder {
        fn on_error(&self, error: ErrorCode, message: &str) {
            self.errors
                .lock()
                .unwrap()
                .push((error, message.to_owned()));
        }

        fn on_stopped(&self, reason: StopReason) {
            self.stops.lock().unwrap().push(reason);
            self.done.notify_one();
        }
    }

    #[test]
    fn raw_code_translation() {
        assert_eq!(
            StopReason::from_raw(codes::DEATH_HANGUP),
            StopReason::Hangup
        );
        assert_eq!(StopReason::from_raw(9999), StopReason::Unknown);
        assert_eq!(
            ErrorCode::from_raw(codes::ERROR_PAYLOAD_CHANGED),
            ErrorCode::PayloadChanged
        );
        assert_eq!(ErrorCode::from_raw(-1), ErrorCode::Unknown);
    }

    #[tokio::test]
    async fn terminal_event_is_delivered_once() {
        let slot = Arc::new(CallbackSlot::default());
        let recorder = Recorder::new();
        slot.set(recorder.clone());

        let (translator, dispatcher) = CallbackTranslator::spawn(slot);
        translator.on_died(codes::DEATH_CRASH);
        translator.report_stopped(StopReason::Killed);
        translator.on_service_died();

        recorder.done.notified().await;
        drop(translator);
        dispatcher.await.unwrap();

        assert_eq!(*recorder.stops.lock().unwrap(), vec![StopReason::Crash]);
    }

    #[tokio::test]
    async fn events_without_callback_are_dropped() {
        let slot = Arc::new(CallbackSlot::default());
        let recorder = Recorder::new();

        let (translator, dispatcher) = CallbackTranslator::spawn(slot.clone());
        translator.on_error(codes::ERROR_PAYLOAD_CHANGED, "while unregistered".into());

        // Register only after the first event; only the second must arrive.
        slot.set(recorder.clone());
        translator.on_error(codes::ERROR_UNKNOWN, "while registered".into());
        drop(translator);
        dispatcher.await.unwrap();

        let errors = recorder.errors.lock().unwrap();
        // The first event may or may not have been drained before
        // registration; only the second is guaranteed.
        assert!(errors.iter().any(|(_, m)| m == "while registered"));
    }
}
