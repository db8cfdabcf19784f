//! Registration bookkeeping for server-side observe (RFC 7641).
//!
//! One [`ObserveHandler`] exists per observable resource.  It maps each (peer, token) pair to the
//! termination handle of the task that is delivering notifications to it, so that re-registering
//! replaces the previous delivery and deregistering stops it.  A peer that answers a
//! notification with RST is dropped as well (RFC 7641 §3.6).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use coap_lite::{CoapRequest, ObserveOption};
use log::debug;
use tokio::sync::{oneshot, watch, Mutex};

use crate::app::observers::Observers;
use crate::app::CoapError;

pub(crate) struct ObserveHandler<Endpoint> {
    observers: Observers,
    next_registration_id: AtomicU64,
    registrations: Arc<Mutex<HashMap<RegistrationKey<Endpoint>, InternalRegistration>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RegistrationKey<Endpoint> {
    peer: Endpoint,
    token: Vec<u8>,
}

#[derive(Debug)]
struct InternalRegistration {
    id: u64,
    termination_tx: oneshot::Sender<()>,
    /// Message ID of the most recent notification, the one a departed peer will reject.
    last_notification: Option<u16>,
}

#[derive(Debug)]
pub(crate) struct RegistrationHandle<Endpoint> {
    id: u64,
    key: RegistrationKey<Endpoint>,
    pub termination_rx: oneshot::Receiver<()>,
    pub notify_rx: watch::Receiver<u32>,
}

#[derive(Debug)]
pub(crate) enum RegistrationEvent<Endpoint> {
    NoChange,
    Unregistered,
    Registered(RegistrationHandle<Endpoint>),
}

impl<Endpoint: Clone + Eq + Hash> ObserveHandler<Endpoint> {
    pub fn new(observers: Observers) -> Self {
        Self {
            observers,
            next_registration_id: AtomicU64::new(0),
            registrations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn maybe_process_registration(
        &self,
        request: &CoapRequest<Endpoint>,
    ) -> Result<RegistrationEvent<Endpoint>, CoapError> {
        let observe_flag = match request.get_observe_flag() {
            None => return Ok(RegistrationEvent::NoChange),
            Some(flag) => flag.map_err(|e| CoapError::bad_request(format!("{e:?}")))?,
        };

        let peer = request
            .source
            .as_ref()
            .ok_or_else(|| CoapError::internal("Missing source!"))?
            .to_owned();
        let key = RegistrationKey {
            peer,
            token: request.message.get_token().to_vec(),
        };

        let mut registrations = self.registrations.lock().await;
        match observe_flag {
            ObserveOption::Register => {
                let id = self.next_registration_id.fetch_add(1, Ordering::Relaxed);
                let (termination_tx, termination_rx) = oneshot::channel();
                let mut notify_rx = self.observers.subscribe();
                notify_rx.borrow_and_update();

                let existing = registrations.insert(
                    key.clone(),
                    InternalRegistration {
                        id,
                        termination_tx,
                        last_notification: None,
                    },
                );
                if let Some(existing) = existing {
                    debug!("Replacing observe registration #{}", existing.id);
                    let _ = existing.termination_tx.send(());
                }

                Ok(RegistrationEvent::Registered(RegistrationHandle {
                    id,
                    key,
                    termination_rx,
                    notify_rx,
                }))
            }
            ObserveOption::Deregister => match registrations.remove(&key) {
                Some(existing) => {
                    let _ = existing.termination_tx.send(());
                    Ok(RegistrationEvent::Unregistered)
                }
                None => Ok(RegistrationEvent::NoChange),
            },
        }
    }

    /// Drop the bookkeeping for a registration whose delivery loop has ended, unless it was
    /// already replaced by a newer registration for the same key.
    pub async fn release(&self, handle: &RegistrationHandle<Endpoint>) {
        let mut registrations = self.registrations.lock().await;
        if registrations.get(&handle.key).map(|r| r.id) == Some(handle.id) {
            registrations.remove(&handle.key);
        }
    }

    pub async fn record_notification(
        &self,
        handle: &RegistrationHandle<Endpoint>,
        message_id: u16,
    ) {
        let mut registrations = self.registrations.lock().await;
        if let Some(registration) = registrations.get_mut(&handle.key) {
            if registration.id == handle.id {
                registration.last_notification = Some(message_id);
            }
        }
    }

    /// Cancel the registration whose latest notification `peer` rejected with RST.  Returns
    /// whether one was found.
    pub async fn cancel_rejected(&self, peer: &Endpoint, message_id: u16) -> bool {
        let mut registrations = self.registrations.lock().await;
        let key = registrations
            .iter()
            .find(|(key, registration)| {
                &key.peer == peer && registration.last_notification == Some(message_id)
            })
            .map(|(key, _)| key.clone());
        match key.and_then(|key| registrations.remove(&key)) {
            Some(registration) => {
                debug!("Observe registration #{} reset by peer", registration.id);
                let _ = registration.termination_tx.send(());
                true
            }
            None => false,
        }
    }

    pub async fn registration_count(&self) -> usize {
        self.registrations.lock().await.len()
    }
}

impl<Endpoint> RegistrationHandle<Endpoint> {
    /// Current sequence number, used for the initial (registration) response.
    pub fn sequence(&self) -> u32 {
        *self.notify_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use coap_lite::{CoapRequest, ObserveOption, RequestType};

    use super::*;

    fn observe_request(peer: u32, token: &[u8], flag: ObserveOption) -> CoapRequest<u32> {
        let mut request = CoapRequest::new();
        request.set_method(RequestType::Get);
        request.set_path("/sensor");
        request.set_observe_flag(flag);
        request.message.set_token(token.to_vec());
        request.source = Some(peer);
        request
    }

    #[tokio::test]
    async fn test_reregistration_replaces_previous() {
        let handler = ObserveHandler::new(Observers::new());

        let first = handler
            .maybe_process_registration(&observe_request(1, b"t", ObserveOption::Register))
            .await
            .unwrap();
        let RegistrationEvent::Registered(mut first) = first else {
            panic!("expected registration");
        };
        let second = handler
            .maybe_process_registration(&observe_request(1, b"t", ObserveOption::Register))
            .await
            .unwrap();
        assert!(matches!(second, RegistrationEvent::Registered(_)));
        assert!((&mut first.termination_rx).await.is_ok());
        assert_eq!(handler.registration_count().await, 1);

        // The stale handle must not evict the newer registration.
        handler.release(&first).await;
        assert_eq!(handler.registration_count().await, 1);
    }

    #[tokio::test]
    async fn test_deregister() {
        let handler = ObserveHandler::new(Observers::new());
        let event = handler
            .maybe_process_registration(&observe_request(1, b"t", ObserveOption::Register))
            .await
            .unwrap();
        let RegistrationEvent::Registered(mut handle) = event else {
            panic!("expected registration");
        };

        let event = handler
            .maybe_process_registration(&observe_request(1, b"t", ObserveOption::Deregister))
            .await
            .unwrap();
        assert!(matches!(event, RegistrationEvent::Unregistered));
        assert!((&mut handle.termination_rx).await.is_ok());
        assert_eq!(handler.registration_count().await, 0);

        let event = handler
            .maybe_process_registration(&observe_request(2, b"t", ObserveOption::Deregister))
            .await
            .unwrap();
        assert!(matches!(event, RegistrationEvent::NoChange));
    }

    #[tokio::test]
    async fn test_reset_cancels_matching_notification_only() {
        let handler = ObserveHandler::new(Observers::new());
        let event = handler
            .maybe_process_registration(&observe_request(1, b"t", ObserveOption::Register))
            .await
            .unwrap();
        let RegistrationEvent::Registered(mut handle) = event else {
            panic!("expected registration");
        };
        handler.record_notification(&handle, 500).await;

        assert!(!handler.cancel_rejected(&1, 499).await);
        assert!(!handler.cancel_rejected(&2, 500).await);
        assert_eq!(handler.registration_count().await, 1);

        assert!(handler.cancel_rejected(&1, 500).await);
        assert!((&mut handle.termination_rx).await.is_ok());
        assert_eq!(handler.registration_count().await, 0);
    }

    #[tokio::test]
    async fn test_plain_request_is_no_change() {
        let handler = ObserveHandler::<u32>::new(Observers::new());
        let mut request = CoapRequest::new();
        request.set_method(RequestType::Get);
        request.source = Some(1);
        let event = handler.maybe_process_registration(&request).await.unwrap();
        assert!(matches!(event, RegistrationEvent::NoChange));
    }
}
