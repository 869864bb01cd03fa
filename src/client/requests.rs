//! The per-client queue of outstanding requests: every packet accepted
//! from the client (or injected by the pooler) whose reply will come
//! from the server appends an entry here. When the server replies, the
//! head entry determines how the reply is handled. The disposition is
//! fixed at enqueue time and never re-evaluated.

use std::collections::VecDeque;

/// What to do with the server's reply to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// Relay the reply to the client.
    Forward,
    /// Consume and drop the reply; the request was injected by the
    /// pooler and the client knows nothing about it.
    Skip,
    /// The request was never sent to the server; the pooler fabricates
    /// the reply itself at this queue position.
    Fake,
}

/// Server-side prepared statement bookkeeping attached to an injected
/// request, so a failed transaction can be rolled back accurately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementEffect {
    /// An injected Parse: the named statement is registered on the
    /// server once ParseComplete arrives.
    Register(String),
    /// An injected Close for an eviction: the named statement was
    /// dropped from the server cache; restore it if the Close never
    /// completed.
    Evict(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingRequest {
    /// The request's one-byte type ('Q', 'P', 'B', ...).
    pub code: u8,
    pub action: ResponseAction,
    pub effect: Option<StatementEffect>,
}

/// FIFO of expected server replies. This queue is the canonical
/// authority for pairing replies with requests.
#[derive(Debug, Default)]
pub struct OutstandingRequests {
    queue: VecDeque<OutstandingRequest>,
}

impl OutstandingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, code: u8, action: ResponseAction) {
        self.queue.push_back(OutstandingRequest {
            code,
            action,
            effect: None,
        });
    }

    pub fn push_with_effect(&mut self, code: u8, action: ResponseAction, effect: StatementEffect) {
        self.queue.push_back(OutstandingRequest {
            code,
            action,
            effect: Some(effect),
        });
    }

    pub fn head(&self) -> Option<&OutstandingRequest> {
        self.queue.front()
    }

    pub fn pop(&mut self) -> Option<OutstandingRequest> {
        self.queue.pop_front()
    }

    /// Pop the head if it carries the expected request code.
    pub fn pop_if(&mut self, code: u8) -> Option<OutstandingRequest> {
        if self.queue.front().map(|r| r.code) == Some(code) {
            self.queue.pop_front()
        } else {
            None
        }
    }

    /// Drain everything, handing each entry to the caller (used on
    /// ReadyForQuery and on client teardown).
    pub fn drain(&mut self) -> impl Iterator<Item = OutstandingRequest> + '_ {
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_is_fifo() {
        let mut requests = OutstandingRequests::new();
        requests.push(b'P', ResponseAction::Skip);
        requests.push(b'B', ResponseAction::Forward);
        requests.push(b'E', ResponseAction::Forward);
        requests.push(b'S', ResponseAction::Forward);

        // ParseComplete pairs with the injected Parse.
        let head = requests.pop_if(b'P').unwrap();
        assert_eq!(head.action, ResponseAction::Skip);

        // BindComplete does not match an 'E' head.
        assert!(requests.pop_if(b'E').is_none());
        assert_eq!(requests.pop_if(b'B').unwrap().action, ResponseAction::Forward);

        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn drain_reports_effects() {
        let mut requests = OutstandingRequests::new();
        requests.push_with_effect(
            b'P',
            ResponseAction::Skip,
            StatementEffect::Register("WARDEN_1".into()),
        );
        requests.push_with_effect(
            b'C',
            ResponseAction::Skip,
            StatementEffect::Evict("WARDEN_0".into()),
        );

        let effects: Vec<_> = requests.drain().filter_map(|r| r.effect).collect();
        assert_eq!(
            effects,
            vec![
                StatementEffect::Register("WARDEN_1".into()),
                StatementEffect::Evict("WARDEN_0".into())
            ]
        );
        assert!(requests.is_empty());
    }
}
