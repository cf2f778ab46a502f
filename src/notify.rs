use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use ulid::Ulid;

use crate::engine::QueuePosition;
use crate::model::*;

const CHANNEL_CAPACITY: usize = 256;

/// Notices waiting for the mail dispatcher.
const OUTBOX_CAPACITY: usize = 1024;

/// Delivery attempts per notice before it is dropped.
const MAX_ATTEMPTS: u32 = 3;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeKind {
    RequestReceived,
    Confirmed,
    Rejected,
    Cancelled,
    /// Sent to the admin mailbox when a user cancels.
    CancellationAlert,
}

/// An outbound message the engine wants sent. Produced after the state change
/// has been committed; delivering it (or failing to) never touches bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub booking_id: Ulid,
    pub to: String,
    pub subject: String,
    pub text: String,
}

fn describe(room_name: &str, b: &Booking) -> String {
    format!("{} ({}) on {} at {}", room_name, b.kind.as_str(), b.date, b.window)
}

impl Notice {
    pub fn request_received(
        user: &User,
        room_name: &str,
        booking: &Booking,
        queue: Option<QueuePosition>,
    ) -> Self {
        let mut text = format!(
            "Hello {}, your request for {} has been received and is awaiting approval.",
            user.name,
            describe(room_name, booking)
        );
        match queue {
            Some(q) if q.ahead == 0 => text.push_str(
                " The slot is currently held by a confirmed booking; you are first in line if it frees up.",
            ),
            Some(q) => text.push_str(&format!(
                " {} earlier request(s) are waiting for the same slot; you are number {} in line.",
                q.ahead,
                q.position()
            )),
            None => {}
        }
        Self {
            kind: NoticeKind::RequestReceived,
            booking_id: booking.id,
            to: user.email.clone(),
            subject: format!("Booking request received: {room_name}"),
            text,
        }
    }

    /// Owner notice for a committed status change. `None` for statuses that
    /// are not announced.
    pub fn status_changed(user: &User, room_name: &str, booking: &Booking) -> Option<Self> {
        let what = describe(room_name, booking);
        let (kind, subject, text) = match booking.status {
            BookingStatus::Confirmed => (
                NoticeKind::Confirmed,
                format!("Booking confirmed: {room_name}"),
                format!("Hello {}, your booking for {what} has been confirmed.", user.name),
            ),
            BookingStatus::Rejected => (
                NoticeKind::Rejected,
                format!("Booking rejected: {room_name}"),
                format!("Hello {}, your booking for {what} has been rejected.", user.name),
            ),
            BookingStatus::Cancelled => (
                NoticeKind::Cancelled,
                format!("Booking cancelled: {room_name}"),
                format!(
                    "Hello {}, your booking for {what} has been cancelled. Reason: {}",
                    user.name,
                    booking.cancellation_reason.as_deref().unwrap_or("-")
                ),
            ),
            BookingStatus::Pending => return None,
        };
        Some(Self {
            kind,
            booking_id: booking.id,
            to: user.email.clone(),
            subject,
            text,
        })
    }

    pub fn cancellation_alert(admin_email: &str, user_name: &str, room_name: &str, booking: &Booking) -> Self {
        Self {
            kind: NoticeKind::CancellationAlert,
            booking_id: booking.id,
            to: admin_email.to_string(),
            subject: format!("Booking cancelled by {user_name}: {room_name}"),
            text: format!(
                "{user_name} cancelled {}. Reason: {}",
                describe(room_name, booking),
                booking.cancellation_reason.as_deref().unwrap_or("-")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailError(pub String);

impl std::fmt::Display for MailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mail delivery failed: {}", self.0)
    }
}

impl std::error::Error for MailError {}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_mail(&self, to: &str, subject: &str, text: &str) -> Result<(), MailError>;
}

/// Writes mail to the log instead of sending it.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_mail(&self, to: &str, subject: &str, text: &str) -> Result<(), MailError> {
        tracing::info!(target: "mail", %to, %subject, "{text}");
        Ok(())
    }
}

/// Outbox for notices: fans out to in-process subscribers and, when a mailer
/// is attached, hands each notice to a background dispatcher.
pub struct NotifyHub {
    subscribers: broadcast::Sender<Notice>,
    outbox: Option<mpsc::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    /// Hub without delivery; notices only reach subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: broadcast::channel(CHANNEL_CAPACITY).0,
            outbox: None,
        }
    }

    /// Hub that also delivers through `mailer`. Must be called inside a runtime.
    pub fn with_mailer(mailer: Arc<dyn Mailer>) -> Self {
        Self::with_mailer_capacity(mailer, OUTBOX_CAPACITY)
    }

    fn with_mailer_capacity(mailer: Arc<dyn Mailer>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        tokio::spawn(run_dispatcher(mailer, rx));
        Self {
            subscribers: broadcast::channel(CHANNEL_CAPACITY).0,
            outbox: Some(tx),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.subscribers.subscribe()
    }

    /// Never blocks and never fails. A full outbox drops the notice.
    pub fn publish(&self, notices: Vec<Notice>) {
        for notice in notices {
            let _ = self.subscribers.send(notice.clone());
            self.enqueue(notice);
        }
    }

    /// Hand a notice to the dispatcher. False when it was dropped.
    fn enqueue(&self, notice: Notice) -> bool {
        let Some(outbox) = &self.outbox else {
            return true;
        };
        match outbox.try_send(notice) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(notice)) => {
                tracing::warn!(
                    "notice outbox full; dropping {:?} notice for booking {}",
                    notice.kind,
                    notice.booking_id
                );
                metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED_TOTAL).increment(1);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("notice dispatcher has shut down; dropping notice");
                false
            }
        }
    }
}

async fn run_dispatcher(mailer: Arc<dyn Mailer>, mut rx: mpsc::Receiver<Notice>) {
    while let Some(notice) = rx.recv().await {
        deliver(mailer.as_ref(), &notice).await;
    }
}

async fn deliver(mailer: &dyn Mailer, notice: &Notice) -> bool {
    for attempt in 1..=MAX_ATTEMPTS {
        match mailer.send_mail(&notice.to, &notice.subject, &notice.text).await {
            Ok(()) => return true,
            Err(e) if attempt < MAX_ATTEMPTS => {
                tracing::debug!("notice {} attempt {attempt} failed: {e}", notice.booking_id);
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => {
                tracing::warn!(
                    "giving up on {:?} notice for booking {} to {}: {e}",
                    notice.kind,
                    notice.booking_id,
                    notice.to
                );
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    fn user() -> User {
        User {
            id: Ulid::new(),
            name: "alice".into(),
            email: "alice@example.com".into(),
            role: Role::User,
        }
    }

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            room_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            window: TimeWindow::new(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            ),
            kind: BookingType::Booking,
            status,
            cancellation_reason: Some("conflict with exam".into()),
            created_at: 0,
        }
    }

    /// Fails the first `failures` sends, then records.
    struct FlakyMailer {
        failures: AtomicU32,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Mailer for FlakyMailer {
        async fn send_mail(&self, to: &str, _subject: &str, _text: &str) -> Result<(), MailError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(MailError("smtp timeout".into()));
            }
            self.sent.lock().await.push(to.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe();

        let notice = Notice::request_received(&user(), "Room 5", &booking(BookingStatus::Pending), None);
        hub.publish(vec![notice.clone()]);

        assert_eq!(rx.recv().await.unwrap(), notice);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(vec![Notice::cancellation_alert(
            "admin@example.com",
            "alice",
            "Room 5",
            &booking(BookingStatus::Cancelled),
        )]);
    }

    #[test]
    fn request_notice_mentions_queue() {
        let b = booking(BookingStatus::Pending);
        let n = Notice::request_received(&user(), "Room 5", &b, Some(QueuePosition { ahead: 2 }));
        assert_eq!(n.to, "alice@example.com");
        assert!(n.text.contains("number 3 in line"));
        assert!(n.text.contains("09:00-10:00"));

        let behind_confirmed =
            Notice::request_received(&user(), "Room 5", &b, Some(QueuePosition { ahead: 0 }));
        assert!(behind_confirmed.text.contains("first in line"));
    }

    #[test]
    fn status_notices() {
        let u = user();
        assert_eq!(
            Notice::status_changed(&u, "R", &booking(BookingStatus::Confirmed)).unwrap().kind,
            NoticeKind::Confirmed
        );
        assert_eq!(
            Notice::status_changed(&u, "R", &booking(BookingStatus::Rejected)).unwrap().kind,
            NoticeKind::Rejected
        );
        let cancelled = Notice::status_changed(&u, "R", &booking(BookingStatus::Cancelled)).unwrap();
        assert!(cancelled.text.contains("conflict with exam"));
        assert!(Notice::status_changed(&u, "R", &booking(BookingStatus::Pending)).is_none());
    }

    #[tokio::test]
    async fn deliver_retries_then_succeeds() {
        let mailer = FlakyMailer {
            failures: AtomicU32::new(MAX_ATTEMPTS - 1),
            sent: Mutex::new(Vec::new()),
        };
        let n = Notice::status_changed(&user(), "R", &booking(BookingStatus::Confirmed)).unwrap();
        assert!(deliver(&mailer, &n).await);
        assert_eq!(mailer.sent.lock().await.as_slice(), ["alice@example.com".to_string()]);
    }

    #[tokio::test]
    async fn deliver_gives_up_after_max_attempts() {
        let mailer = FlakyMailer {
            failures: AtomicU32::new(MAX_ATTEMPTS),
            sent: Mutex::new(Vec::new()),
        };
        let n = Notice::status_changed(&user(), "R", &booking(BookingStatus::Rejected)).unwrap();
        assert!(!deliver(&mailer, &n).await);
        assert!(mailer.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn dispatcher_delivers_published_notices() {
        let mailer = Arc::new(FlakyMailer {
            failures: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        });
        let hub = NotifyHub::with_mailer(mailer.clone());
        let n = Notice::status_changed(&user(), "R", &booking(BookingStatus::Confirmed)).unwrap();
        hub.publish(vec![n]);

        for _ in 0..50 {
            if !mailer.sent.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mailer.sent.lock().await.len(), 1);
    }

    /// Never completes a send.
    struct StuckMailer;

    #[async_trait]
    impl Mailer for StuckMailer {
        async fn send_mail(&self, _to: &str, _subject: &str, _text: &str) -> Result<(), MailError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stuck_mailer_cannot_grow_the_outbox() {
        let hub = NotifyHub::with_mailer_capacity(Arc::new(StuckMailer), 2);
        let mut rx = hub.subscribe();
        let n = Notice::status_changed(&user(), "R", &booking(BookingStatus::Confirmed)).unwrap();

        // The dispatcher takes the first notice and hangs on it.
        assert!(hub.enqueue(n.clone()));
        tokio::task::yield_now().await;
        assert!(hub.enqueue(n.clone()));
        assert!(hub.enqueue(n.clone()));
        assert!(!hub.enqueue(n.clone()));

        // Subscribers still see everything that is published.
        hub.publish(vec![n.clone()]);
        assert_eq!(rx.recv().await.unwrap(), n);
    }
}
