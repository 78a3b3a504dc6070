//! Single-in-flight request/response exchange
//!
//! The peripheral protocol carries no request ids: whatever arrives on the
//! read endpoint after a write is taken as the answer to the one outstanding
//! request. Correctness rests on three rules enforced here:
//!
//! - at most one exchange is pending at a time;
//! - every armed exchange and every cancellation advances the shared
//!   [`Generation`], and a notification stamped with an older generation is
//!   dropped instead of completing the current exchange;
//! - an unanswered exchange is re-sent on each poll tick until the retry
//!   budget runs out, which ends it with exactly one `PairingTimeout`.
//!
//! Content is never inspected, so an unsolicited push that lands while an
//! exchange is pending is indistinguishable from the answer.

use log::{debug, info, warn};

use crate::core::bluetooth::error::LinkError;
use crate::core::bluetooth::frame;
use crate::core::bluetooth::radio::{Generation, Radio};
use crate::core::bluetooth::types::{DeviceId, EndpointSet};

/// The one outstanding request
#[derive(Debug, Clone, PartialEq)]
pub struct PendingExchange {
    pub frame: Vec<u8>,
    pub generation: u64,
}

/// What a poll tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Idle,
    /// The pending frame was written again
    Resent,
    /// Keepalive armed a fresh status request
    Requested,
    /// The budget ran out; the pending exchange is gone
    TimedOut,
}

/// How an inbound notification was classified
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Completed(Vec<u8>),
    Unsolicited(Vec<u8>),
    Stale,
}

pub struct ExchangeController {
    chunk_size: usize,
    retry_budget: u32,
    remaining: u32,
    pending: Option<PendingExchange>,
    generation: Generation,
    /// Status request re-armed by keepalive polling
    keepalive: Option<Vec<u8>>,
    answered_since_tick: bool,
}

impl ExchangeController {
    pub fn new(chunk_size: usize, retry_budget: u32, generation: Generation) -> Self {
        Self {
            chunk_size,
            retry_budget,
            remaining: retry_budget,
            pending: None,
            generation,
            keepalive: None,
            answered_since_tick: false,
        }
    }

    pub fn pending(&self) -> Option<&PendingExchange> {
        self.pending.as_ref()
    }

    pub fn remaining_budget(&self) -> u32 {
        self.remaining
    }

    pub fn generation(&self) -> u64 {
        self.generation.current()
    }

    pub fn is_polling(&self) -> bool {
        self.keepalive.is_some()
    }

    /// Whether the poll timer should be running
    pub fn cadence_active(&self) -> bool {
        self.pending.is_some() || self.keepalive.is_some()
    }

    /// Write `frame` to the ready link and arm it as the pending exchange.
    /// Rejections leave everything untouched.
    pub fn send<R: Radio>(
        &mut self,
        radio: &mut R,
        link: Option<(&DeviceId, &EndpointSet)>,
        frame: Vec<u8>,
    ) -> Result<(), LinkError> {
        let (device, endpoints) = link.ok_or(LinkError::NoActiveConnection)?;
        if self.pending.is_some() {
            return Err(LinkError::ExchangeInProgress);
        }
        let chunks = frame::chunk(&frame, self.chunk_size)?;
        self.arm(frame);
        write_chunks(radio, device, endpoints, &chunks);
        Ok(())
    }

    /// Enable keepalive polling with `status_frame`
    pub fn start_polling(
        &mut self,
        link: Option<(&DeviceId, &EndpointSet)>,
        status_frame: Vec<u8>,
    ) -> Result<(), LinkError> {
        if link.is_none() {
            return Err(LinkError::NoActiveConnection);
        }
        frame::chunk(&status_frame, self.chunk_size)?;
        info!("Keepalive polling started");
        self.keepalive = Some(status_frame);
        self.remaining = self.retry_budget;
        self.answered_since_tick = false;
        Ok(())
    }

    pub fn stop_polling(&mut self) {
        if self.keepalive.take().is_some() {
            info!("Keepalive polling stopped");
        }
    }

    /// Advance the poll cadence by one tick
    pub fn on_tick<R: Radio>(
        &mut self,
        radio: &mut R,
        link: Option<(&DeviceId, &EndpointSet)>,
    ) -> TickOutcome {
        let answered = std::mem::take(&mut self.answered_since_tick);
        let Some((device, endpoints)) = link else {
            return TickOutcome::Idle;
        };

        if let Some(pending) = &self.pending {
            self.remaining = self.remaining.saturating_sub(1);
            if self.remaining == 0 {
                warn!("No response after {} poll(s), giving up", self.retry_budget);
                self.pending = None;
                self.keepalive = None;
                self.remaining = self.retry_budget;
                return TickOutcome::TimedOut;
            }
            debug!("Re-sending pending frame, {} poll(s) left", self.remaining);
            // Validated when the exchange was armed
            if let Ok(chunks) = frame::chunk(&pending.frame, self.chunk_size) {
                write_chunks(radio, device, endpoints, &chunks);
            }
            return TickOutcome::Resent;
        }

        if answered {
            return TickOutcome::Idle;
        }
        let Some(status_frame) = self.keepalive.clone() else {
            return TickOutcome::Idle;
        };
        let Ok(chunks) = frame::chunk(&status_frame, self.chunk_size) else {
            return TickOutcome::Idle;
        };
        self.arm(status_frame);
        write_chunks(radio, device, endpoints, &chunks);
        TickOutcome::Requested
    }

    /// Classify a notification stamped with `generation`
    pub fn deliver(&mut self, generation: u64, value: Vec<u8>) -> Delivery {
        if generation != self.generation.current() {
            debug!(
                "Dropping stale notification (generation {} != {})",
                generation,
                self.generation.current()
            );
            return Delivery::Stale;
        }
        self.answered_since_tick = true;
        match self.pending.take() {
            Some(_) => {
                self.remaining = self.retry_budget;
                Delivery::Completed(value)
            }
            None => Delivery::Unsolicited(value),
        }
    }

    /// Drop the pending exchange and stop polling; the link is gone
    pub fn cancel(&mut self) {
        if self.pending.take().is_some() {
            debug!("Pending exchange cancelled");
        }
        self.keepalive = None;
        self.remaining = self.retry_budget;
        self.answered_since_tick = false;
        self.generation.advance();
    }

    fn arm(&mut self, frame: Vec<u8>) {
        let generation = self.generation.advance();
        debug!("Exchange armed (generation {}, {} bytes)", generation, frame.len());
        self.pending = Some(PendingExchange { frame, generation });
    }
}

fn write_chunks<R: Radio>(
    radio: &mut R,
    device: &DeviceId,
    endpoints: &EndpointSet,
    chunks: &[Vec<u8>],
) {
    for chunk in chunks {
        radio.write(device, endpoints.write, chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{
        DEFAULT_PAIRING_RETRY_BUDGET, FRAME_CHUNK_SIZE, STATUS_REQUEST_FRAME,
        UUID_CURRENT_READ_CHAR, UUID_CURRENT_WRITE_CHAR,
    };
    use crate::core::bluetooth::types::VariantKind;
    use uuid::Uuid;

    #[derive(Default)]
    struct Writes(Vec<Vec<u8>>);

    impl Radio for Writes {
        fn start_scan(&mut self, _: &[Uuid]) {}
        fn stop_scan(&mut self) {}
        fn connect(&mut self, _: &DeviceId) {}
        fn disconnect(&mut self, _: &DeviceId) {}
        fn discover_services(&mut self, _: &DeviceId) {}
        fn set_notify(&mut self, _: &DeviceId, _: Uuid, _: bool) {}
        fn write(&mut self, _: &DeviceId, characteristic: Uuid, data: &[u8]) {
            assert_eq!(characteristic, UUID_CURRENT_WRITE_CHAR);
            self.0.push(data.to_vec());
        }
    }

    struct Fixture {
        device: DeviceId,
        endpoints: EndpointSet,
        radio: Writes,
        exchange: ExchangeController,
    }

    impl Fixture {
        fn new(budget: u32) -> Self {
            Self {
                device: DeviceId::new("valve-1"),
                endpoints: EndpointSet {
                    variant: VariantKind::Current,
                    write: UUID_CURRENT_WRITE_CHAR,
                    read: UUID_CURRENT_READ_CHAR,
                },
                radio: Writes::default(),
                exchange: ExchangeController::new(FRAME_CHUNK_SIZE, budget, Generation::default()),
            }
        }

        fn send(&mut self, frame: Vec<u8>) -> Result<(), LinkError> {
            self.exchange
                .send(&mut self.radio, Some((&self.device, &self.endpoints)), frame)
        }

        fn tick(&mut self) -> TickOutcome {
            self.exchange
                .on_tick(&mut self.radio, Some((&self.device, &self.endpoints)))
        }

        fn deliver(&mut self, value: Vec<u8>) -> Delivery {
            let generation = self.exchange.generation();
            self.exchange.deliver(generation, value)
        }
    }

    #[test]
    fn send_without_link_is_rejected() {
        let mut f = Fixture::new(DEFAULT_PAIRING_RETRY_BUDGET);
        assert_eq!(
            f.exchange.send(&mut f.radio, None, vec![1]),
            Err(LinkError::NoActiveConnection)
        );
        assert!(f.radio.0.is_empty());
        assert!(f.exchange.pending().is_none());
    }

    #[test]
    fn second_send_while_pending_never_writes() {
        let mut f = Fixture::new(DEFAULT_PAIRING_RETRY_BUDGET);
        f.send(vec![1, 2, 3]).unwrap();
        let generation = f.exchange.generation();
        assert_eq!(f.send(vec![9]), Err(LinkError::ExchangeInProgress));
        assert_eq!(f.radio.0, vec![vec![1, 2, 3]]);
        assert_eq!(f.exchange.generation(), generation);
    }

    #[test]
    fn long_frames_are_written_in_chunks() {
        let mut f = Fixture::new(DEFAULT_PAIRING_RETRY_BUDGET);
        f.send(vec![7; 45]).unwrap();
        let sizes: Vec<usize> = f.radio.0.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![20, 20, 5]);
    }

    #[test]
    fn resends_then_completes_and_resets_budget() {
        let mut f = Fixture::new(DEFAULT_PAIRING_RETRY_BUDGET);
        f.send(STATUS_REQUEST_FRAME.to_vec()).unwrap();
        assert_eq!(f.tick(), TickOutcome::Resent);
        assert_eq!(f.tick(), TickOutcome::Resent);
        assert_eq!(f.exchange.remaining_budget(), DEFAULT_PAIRING_RETRY_BUDGET - 2);
        assert_eq!(f.radio.0.len(), 3);
        assert!(f.radio.0.iter().all(|w| w == &STATUS_REQUEST_FRAME.to_vec()));

        let delivery = f.deliver(vec![0xAA, 0x01]);
        assert_eq!(delivery, Delivery::Completed(vec![0xAA, 0x01]));
        assert!(f.exchange.pending().is_none());
        assert_eq!(f.exchange.remaining_budget(), DEFAULT_PAIRING_RETRY_BUDGET);
        assert!(!f.exchange.cadence_active());
    }

    #[test]
    fn exhausted_budget_times_out_exactly_once() {
        let mut f = Fixture::new(3);
        f.send(vec![1]).unwrap();
        let outcomes: Vec<_> = (0..5).map(|_| f.tick()).collect();
        assert_eq!(
            outcomes,
            vec![
                TickOutcome::Resent,
                TickOutcome::Resent,
                TickOutcome::TimedOut,
                TickOutcome::Idle,
                TickOutcome::Idle,
            ]
        );
        assert!(f.exchange.pending().is_none());
        assert_eq!(f.exchange.remaining_budget(), 3);
        // A send is possible again after the timeout
        assert!(f.send(vec![2]).is_ok());
    }

    #[test]
    fn stale_notification_does_not_complete_a_newer_exchange() {
        let mut f = Fixture::new(DEFAULT_PAIRING_RETRY_BUDGET);
        f.send(vec![1]).unwrap();
        let stamp_before_disconnect = f.exchange.generation();
        f.exchange.cancel();
        f.send(vec![2]).unwrap();

        assert_eq!(
            f.exchange.deliver(stamp_before_disconnect, vec![0xFF]),
            Delivery::Stale
        );
        assert_eq!(f.exchange.pending().map(|p| p.frame.clone()), Some(vec![2]));
    }

    #[test]
    fn notification_without_pending_is_unsolicited() {
        let mut f = Fixture::new(DEFAULT_PAIRING_RETRY_BUDGET);
        assert_eq!(f.deliver(vec![5]), Delivery::Unsolicited(vec![5]));
    }

    #[test]
    fn keepalive_requests_skip_one_tick_after_an_answer() {
        let mut f = Fixture::new(DEFAULT_PAIRING_RETRY_BUDGET);
        f.exchange
            .start_polling(Some((&f.device, &f.endpoints)), STATUS_REQUEST_FRAME.to_vec())
            .unwrap();
        assert_eq!(f.tick(), TickOutcome::Requested);
        assert!(matches!(f.deliver(vec![1]), Delivery::Completed(_)));
        assert_eq!(f.tick(), TickOutcome::Idle);
        assert_eq!(f.tick(), TickOutcome::Requested);
        assert!(f.exchange.cadence_active());
    }

    #[test]
    fn keepalive_timeout_stops_polling() {
        let mut f = Fixture::new(2);
        f.exchange
            .start_polling(Some((&f.device, &f.endpoints)), STATUS_REQUEST_FRAME.to_vec())
            .unwrap();
        assert_eq!(f.tick(), TickOutcome::Requested);
        assert_eq!(f.tick(), TickOutcome::Resent);
        assert_eq!(f.tick(), TickOutcome::TimedOut);
        assert!(!f.exchange.is_polling());
        assert!(!f.exchange.cadence_active());
    }

    #[test]
    fn cancel_clears_everything_and_advances_generation() {
        let mut f = Fixture::new(DEFAULT_PAIRING_RETRY_BUDGET);
        f.exchange
            .start_polling(Some((&f.device, &f.endpoints)), STATUS_REQUEST_FRAME.to_vec())
            .unwrap();
        f.send(vec![1]).unwrap();
        let generation = f.exchange.generation();
        f.exchange.cancel();
        assert!(f.exchange.pending().is_none());
        assert!(!f.exchange.cadence_active());
        assert_eq!(f.exchange.generation(), generation + 1);
    }

    #[test]
    fn polling_requires_a_link() {
        let mut f = Fixture::new(DEFAULT_PAIRING_RETRY_BUDGET);
        assert_eq!(
            f.exchange.start_polling(None, STATUS_REQUEST_FRAME.to_vec()),
            Err(LinkError::NoActiveConnection)
        );
    }
}
