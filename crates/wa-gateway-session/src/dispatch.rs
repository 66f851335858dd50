//! Paced broadcast dispatch.
//!
//! A broadcast sends one rendered message per recipient, strictly in input
//! order, sleeping a random pacing delay between recipients. It runs as a
//! detached task; its progress is published to the [`DispatchLog`].
//!
//! [`DispatchLog`]: wa_gateway_core::DispatchLog

use std::{
    fmt,
    sync::{Arc, LazyLock},
    time::Duration,
};

use chrono::{DateTime, Local, TimeZone};
use rand::Rng as _;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;
use wa_gateway_core::{
    BroadcastId, ChatId, ConnectionFactory, DispatchEvent, MediaPayload, MessageContent,
    SessionStore,
};

use crate::{
    config::PacingConfig,
    error::ManagerError,
    manager::{SessionManager, Shared, send_via},
    registry::RegistryEntry,
};

static NAME_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\{\{\s*name\s*\}\}").unwrap());

/// One broadcast target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Bare number or qualified address.
    pub address: String,
    /// Substituted for `{{name}}`; empty when not given.
    pub alias: String,
}

/// Parse `address|alias,address,...` into recipients, in order.
///
/// Entries are trimmed; empty entries (and entries with an empty address)
/// are dropped.
#[must_use]
pub fn parse_recipients(list: &str) -> Vec<Recipient> {
    list.split(',')
        .filter_map(|entry| {
            let (address, alias) = entry.split_once('|').unwrap_or((entry, ""));
            let address = address.trim();
            if address.is_empty() {
                return None;
            }
            Some(Recipient {
                address: address.to_string(),
                alias: alias.trim().to_string(),
            })
        })
        .collect()
}

/// Replace every `{{name}}` (any case, any inner whitespace) with `alias`.
#[must_use]
pub fn render_template(template: &str, alias: &str) -> String {
    NAME_PLACEHOLDER
        .replace_all(template, regex::NoExpand(alias))
        .into_owned()
}

/// Footer appended to a broadcast message when timestamps are requested.
#[must_use]
pub fn timestamp_footer<Tz>(label: &str, at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    format!("\n\n{label} : {}", at.format("%a, %d %B %Y %H:%M:%S"))
}

/// Random delay between consecutive recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    min_ms: u64,
    max_ms: u64,
}

impl Pacing {
    /// Window `[min_ms, max_ms)`.
    #[must_use]
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    /// Draw the next delay uniformly from the window. A degenerate window
    /// always yields its lower bound.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::rng().random_range(self.min_ms..self.max_ms))
    }
}

impl From<PacingConfig> for Pacing {
    fn from(config: PacingConfig) -> Self {
        Self::new(config.min_delay_ms, config.max_delay_ms)
    }
}

/// A broadcast to start.
#[derive(Debug, Clone)]
pub struct BroadcastRequest {
    pub session_name: String,
    /// `address|alias` entries separated by commas.
    pub recipients: String,
    /// Message text; may contain `{{name}}`. Becomes the caption with media.
    pub template: Option<String>,
    pub media: Option<MediaPayload>,
    /// Append a send-time footer to each message.
    pub timestamp_footer: bool,
}

/// Acknowledgement of an accepted broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastTicket {
    pub broadcast_id: BroadcastId,
    pub session_name: String,
    pub recipients: usize,
}

impl<S, F> SessionManager<S, F>
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    /// Validate a broadcast and schedule it as a detached task.
    ///
    /// Returns as soon as the task is spawned; outcomes are published to
    /// [`SessionManager::dispatch_log`].
    ///
    /// # Errors
    /// Returns `Validation` for an empty recipient list or missing content,
    /// and `NotReady` if the session has no registered connection.
    pub fn broadcast(&self, request: BroadcastRequest) -> Result<BroadcastTicket, ManagerError> {
        let recipients = parse_recipients(&request.recipients);
        if recipients.is_empty() {
            return Err(ManagerError::Validation("to is required".to_string()));
        }
        let content = MessageContent::new(request.template, request.media)?;
        let session_name = request.session_name.trim();

        let entry = self
            .shared
            .registry
            .get(session_name)
            .ok_or_else(|| ManagerError::not_ready(session_name, None))?;

        let ticket = BroadcastTicket {
            broadcast_id: Uuid::new_v4(),
            session_name: session_name.to_string(),
            recipients: recipients.len(),
        };

        let footer_label = request
            .timestamp_footer
            .then(|| self.shared.config.timestamp_footer_label.clone());
        let run = Broadcast {
            shared: Arc::clone(&self.shared),
            id: ticket.broadcast_id,
            session_name: ticket.session_name.clone(),
            entry,
            recipients,
            content,
            footer_label,
            pacing: self.shared.config.pacing.into(),
        };
        tokio::spawn(run.run());

        Ok(ticket)
    }
}

struct Broadcast<S, F> {
    shared: Arc<Shared<S, F>>,
    id: BroadcastId,
    session_name: String,
    entry: RegistryEntry,
    recipients: Vec<Recipient>,
    content: MessageContent,
    footer_label: Option<String>,
    pacing: Pacing,
}

#[derive(Default)]
struct Tally {
    sent: usize,
    failed: usize,
    abandoned: usize,
}

impl<S, F> Broadcast<S, F>
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    async fn run(self) {
        let log = &self.shared.dispatch_log;
        log.push(DispatchEvent::Started {
            broadcast_id: self.id,
            session_name: self.session_name.clone(),
            recipients: self.recipients.len(),
        });
        tracing::info!(
            session = %self.session_name,
            broadcast = %self.id,
            recipients = self.recipients.len(),
            "Broadcast started"
        );

        let mut tally = Tally::default();
        let last = self.recipients.len().saturating_sub(1);

        for (index, recipient) in self.recipients.iter().enumerate() {
            if !self.connection_alive() {
                self.abandon(&self.recipients[index..], &mut tally);
                break;
            }

            self.deliver(recipient, &mut tally).await;

            if index == last {
                break;
            }
            let delay = self.pacing.next_delay();
            tracing::debug!(session = %self.session_name, ?delay, "Pacing broadcast");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.entry.cancel.cancelled() => {
                    self.abandon(&self.recipients[index + 1..], &mut tally);
                    break;
                }
            }
        }

        log.push(DispatchEvent::Finished {
            broadcast_id: self.id,
            session_name: self.session_name.clone(),
            sent: tally.sent,
            failed: tally.failed,
            abandoned: tally.abandoned,
        });
        tracing::info!(
            session = %self.session_name,
            broadcast = %self.id,
            sent = tally.sent,
            failed = tally.failed,
            abandoned = tally.abandoned,
            "Broadcast finished"
        );
    }

    fn connection_alive(&self) -> bool {
        !self.entry.cancel.is_cancelled()
            && self
                .shared
                .registry
                .is_current(&self.session_name, self.entry.id)
    }

    async fn deliver(&self, recipient: &Recipient, tally: &mut Tally) {
        let result = match ChatId::normalize(&recipient.address) {
            Ok(to) => {
                let content = self.personalize(&recipient.alias);
                send_via(
                    &self.session_name,
                    self.entry.connection.as_ref(),
                    &to,
                    &content,
                )
                .await
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(sent) => {
                tally.sent += 1;
                self.shared.dispatch_log.push(DispatchEvent::Sent {
                    broadcast_id: self.id,
                    session_name: self.session_name.clone(),
                    recipient: recipient.address.clone(),
                    message_id: sent.id,
                });
            }
            Err(e) => {
                tally.failed += 1;
                tracing::warn!(
                    session = %self.session_name,
                    recipient = %recipient.address,
                    error = %e,
                    "Broadcast send failed"
                );
                self.shared.dispatch_log.push(DispatchEvent::Failed {
                    broadcast_id: self.id,
                    session_name: self.session_name.clone(),
                    recipient: recipient.address.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    fn abandon(&self, rest: &[Recipient], tally: &mut Tally) {
        let reason = ManagerError::not_ready(&self.session_name, None).to_string();
        tracing::warn!(
            session = %self.session_name,
            remaining = rest.len(),
            "Connection gone, abandoning broadcast"
        );
        for recipient in rest {
            tally.abandoned += 1;
            self.shared.dispatch_log.push(DispatchEvent::Abandoned {
                broadcast_id: self.id,
                session_name: self.session_name.clone(),
                recipient: recipient.address.clone(),
                reason: reason.clone(),
            });
        }
    }

    /// Render the message for one recipient.
    fn personalize(&self, alias: &str) -> MessageContent {
        let render = |text: &str| {
            let mut out = render_template(text, alias);
            if let Some(label) = &self.footer_label {
                out.push_str(&timestamp_footer(label, &Local::now()));
            }
            out
        };

        match &self.content {
            MessageContent::Text(text) => MessageContent::Text(render(text)),
            MessageContent::Media { media, caption } => MessageContent::Media {
                media: media.clone(),
                caption: caption.as_deref().map(render),
            },
        }
    }
}
