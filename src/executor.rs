//! Automatic unsubscribe execution.
//!
//! Runs the machine-actionable unsubscribe methods: sending a mail for
//! `Mailto` targets and issuing an empty POST for `Post` targets. The
//! executor reports plain success or failure per sender; it never fails
//! the batch, because one list server misbehaving says nothing about the
//! next one in the queue.

use tracing::{debug, info, warn};

use crate::client::MailStore;
use crate::models::UnsubscribeMethod;

pub struct AutoUnsubscribeExecutor<S> {
    store: S,
    mail_subject: String,
    mail_body: String,
}

impl<S: MailStore> AutoUnsubscribeExecutor<S> {
    /// # Arguments
    /// * `store` - Mail store used for sending and posting
    /// * `mail_subject` - Subject line for generated unsubscribe mails
    /// * `mail_body` - Body for generated unsubscribe mails
    pub fn new(store: S, mail_subject: impl Into<String>, mail_body: impl Into<String>) -> Self {
        Self {
            store,
            mail_subject: mail_subject.into(),
            mail_body: mail_body.into(),
        }
    }

    /// Attempt the automatic unsubscribe for one sender.
    ///
    /// Returns true when the list server accepted the request. Failures
    /// are logged and reported as false.
    pub async fn execute_auto(&self, sender_email: &str, method: &UnsubscribeMethod) -> bool {
        match method {
            UnsubscribeMethod::Mailto(address) => {
                // Anything after '?' is header hints, not part of the address
                let recipient = address.split('?').next().unwrap_or(address);

                match self
                    .store
                    .send_mail(recipient, &self.mail_subject, &self.mail_body)
                    .await
                {
                    Ok(()) => {
                        info!("Unsubscribe mail for {} sent to {}", sender_email, recipient);
                        true
                    }
                    Err(e) => {
                        warn!("Unsubscribe mail for {} failed: {}", sender_email, e);
                        false
                    }
                }
            }
            UnsubscribeMethod::Post(url) => match self.store.post_to(url).await {
                Ok(()) => {
                    info!("Unsubscribe POST for {} accepted", sender_email);
                    true
                }
                Err(e) => {
                    warn!("Unsubscribe POST for {} failed: {}", sender_email, e);
                    false
                }
            },
            UnsubscribeMethod::ClickLink(_) | UnsubscribeMethod::None => {
                // The workflow routes these to the manual queues before the
                // executor runs; landing here means a routing bug upstream
                debug!(
                    "execute_auto called with non-automatic method for {}",
                    sender_email
                );
                false
            }
        }
    }
}
