use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const NOTICE_TTL: Duration = Duration::from_secs(3);
const MAX_NOTICES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub expires_at: Instant,
}

/// Transient, auto-dismissing notifications.
#[derive(Debug, Clone)]
pub struct NoticeBoard {
    notices: VecDeque<Notice>,
    ttl: Duration,
}

impl Default for NoticeBoard {
    fn default() -> Self {
        Self::new(NOTICE_TTL)
    }
}

impl NoticeBoard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            notices: VecDeque::new(),
            ttl,
        }
    }

    pub fn push(&mut self, level: NoticeLevel, message: impl Into<String>, now: Instant) {
        if self.notices.len() == MAX_NOTICES {
            self.notices.pop_front();
        }
        self.notices.push_back(Notice {
            level,
            message: message.into(),
            expires_at: now + self.ttl,
        });
    }

    /// Newest notice still showing at `now`.
    pub fn current(&self, now: Instant) -> Option<&Notice> {
        self.notices.iter().rev().find(|notice| notice.expires_at > now)
    }

    pub fn prune(&mut self, now: Instant) {
        self.notices.retain(|notice| notice.expires_at > now);
    }

    pub fn is_empty(&self) -> bool {
        self.notices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_expire_after_ttl() {
        let start = Instant::now();
        let mut board = NoticeBoard::default();
        board.push(NoticeLevel::Success, "saved", start);
        board.push(NoticeLevel::Error, "rejected", start + Duration::from_secs(1));

        assert_eq!(board.current(start + Duration::from_secs(2)).map(|n| n.message.as_str()), Some("rejected"));
        assert_eq!(board.current(start + Duration::from_millis(3500)).map(|n| n.level), Some(NoticeLevel::Error));
        assert!(board.current(start + Duration::from_secs(4)).is_none());

        board.prune(start + Duration::from_secs(4));
        assert!(board.is_empty());
    }
}
