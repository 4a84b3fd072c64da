//! Event validation: structural, temporal, id, signature, and kind rules.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use thiserror::Error;

use crate::event::Event;

/// Maximum content length accepted for any event, in bytes.
pub const MAX_CONTENT_LEN: usize = 65_536;
/// Maximum number of tags per event.
pub const MAX_TAGS: usize = 2_000;
/// Maximum length of a single tag value, in bytes.
pub const MAX_TAG_VALUE_LEN: usize = 1_024;
/// Maximum content length for long-form articles (kind 30023), in bytes.
pub const MAX_LONG_FORM_LEN: usize = 131_072;

/// Why an event was refused. Rendered into the `OK` message sent back to the
/// publisher; the validator itself never mutates state.
#[derive(Debug, Error, PartialEq)]
pub enum RejectReason {
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("too-large: {0}")]
    TooLarge(String),
    #[error("timestamp-out-of-range: created_at {0} outside accepted window")]
    TimestampOutOfRange(i64),
    #[error("invalid-id: declared id does not match event digest")]
    InvalidId,
    #[error("bad-signature: signature does not verify against pubkey and id")]
    BadSignature,
    #[error("kind-constraint-violated: {0}")]
    KindConstraint(String),
}

/// Validation rule selected once per event from its kind range, rather than
/// branching ad hoc at each call site.
#[derive(Debug, Clone, Copy, PartialEq)]
enum KindRule {
    /// Kind 0: profile metadata, content must be a JSON document.
    Metadata,
    /// Kind 4: legacy direct message, exactly one `p` tag.
    DirectMessage,
    /// Kind 5: deletion request, at least one `e` tag naming the target.
    Deletion,
    /// Kind 7: reaction, must reference an event via `e` tag.
    Reaction,
    /// Kind 30023: long-form article, `d` tag plus tighter content bounds.
    LongForm,
    /// Kinds 30000-39999: addressable, require a `d` identifier tag.
    Addressable,
    /// Everything else carries no extra constraints.
    Plain,
}

impl KindRule {
    fn for_kind(kind: u32) -> Self {
        match kind {
            0 => KindRule::Metadata,
            4 => KindRule::DirectMessage,
            5 => KindRule::Deletion,
            7 => KindRule::Reaction,
            30023 => KindRule::LongForm,
            30000..=39999 => KindRule::Addressable,
            _ => KindRule::Plain,
        }
    }

    fn check(self, ev: &Event) -> Result<(), RejectReason> {
        match self {
            KindRule::Metadata => {
                if !ev.content.is_empty()
                    && serde_json::from_str::<serde_json::Value>(&ev.content).is_err()
                {
                    return Err(RejectReason::KindConstraint(
                        "metadata content must be valid JSON".into(),
                    ));
                }
                Ok(())
            }
            KindRule::DirectMessage => {
                let p_tags = ev.tags.iter().filter(|t| t.name() == Some("p")).count();
                if p_tags != 1 {
                    return Err(RejectReason::KindConstraint(
                        "direct message must have exactly one 'p' tag".into(),
                    ));
                }
                Ok(())
            }
            KindRule::Deletion => {
                if !ev.has_tag("e") {
                    return Err(RejectReason::KindConstraint(
                        "deletion must name at least one 'e' tag".into(),
                    ));
                }
                Ok(())
            }
            KindRule::Reaction => {
                if !ev.has_tag("e") {
                    return Err(RejectReason::KindConstraint(
                        "reaction must reference an event via 'e' tag".into(),
                    ));
                }
                Ok(())
            }
            KindRule::LongForm => {
                if ev.tag_value("d").is_none() {
                    return Err(RejectReason::KindConstraint(
                        "long-form article must carry a 'd' identifier tag".into(),
                    ));
                }
                if ev.content.is_empty() {
                    return Err(RejectReason::KindConstraint(
                        "long-form article must have content".into(),
                    ));
                }
                if ev.content.len() > MAX_LONG_FORM_LEN {
                    return Err(RejectReason::KindConstraint(
                        "long-form article content too long".into(),
                    ));
                }
                Ok(())
            }
            KindRule::Addressable => {
                if ev.tag_value("d").is_none() {
                    return Err(RejectReason::KindConstraint(
                        "addressable event must carry a 'd' identifier tag".into(),
                    ));
                }
                Ok(())
            }
            KindRule::Plain => Ok(()),
        }
    }
}

/// Stateless event validator configured with clock-skew tolerances.
#[derive(Debug, Clone)]
pub struct Validator {
    /// Seconds `created_at` may lag behind the relay clock.
    pub max_past_skew: i64,
    /// Seconds `created_at` may run ahead of the relay clock.
    pub max_future_skew: i64,
    /// Whether Schnorr signatures are checked. Disabled only in offline
    /// tooling; the serving path always verifies.
    pub verify_sig: bool,
}

impl Validator {
    pub fn new(max_past_skew: i64, max_future_skew: i64, verify_sig: bool) -> Self {
        Self {
            max_past_skew,
            max_future_skew,
            verify_sig,
        }
    }

    /// Run all checks in order, short-circuiting on the first failure:
    /// structural, temporal, id recomputation, signature, kind rules.
    pub fn validate(&self, ev: &Event) -> Result<(), RejectReason> {
        self.check_structure(ev)?;
        self.check_timestamp(ev, unix_now())?;
        self.check_id(ev)?;
        if self.verify_sig {
            check_signature(ev)?;
        }
        KindRule::for_kind(ev.kind).check(ev)
    }

    fn check_structure(&self, ev: &Event) -> Result<(), RejectReason> {
        if ev.id.len() != 64 || hex::decode(&ev.id).is_err() {
            return Err(RejectReason::Malformed("id must be 64 hex chars".into()));
        }
        if ev.pubkey.len() != 64 || hex::decode(&ev.pubkey).is_err() {
            return Err(RejectReason::Malformed(
                "pubkey must be 64 hex chars".into(),
            ));
        }
        if ev.sig.len() != 128 || hex::decode(&ev.sig).is_err() {
            return Err(RejectReason::Malformed("sig must be 128 hex chars".into()));
        }
        if ev.content.len() > MAX_CONTENT_LEN {
            return Err(RejectReason::TooLarge(format!(
                "content {} bytes exceeds {}",
                ev.content.len(),
                MAX_CONTENT_LEN
            )));
        }
        if ev.tags.len() > MAX_TAGS {
            return Err(RejectReason::TooLarge(format!(
                "{} tags exceeds {}",
                ev.tags.len(),
                MAX_TAGS
            )));
        }
        for tag in &ev.tags {
            if tag.0.iter().any(|v| v.len() > MAX_TAG_VALUE_LEN) {
                return Err(RejectReason::TooLarge("tag value too long".into()));
            }
        }
        Ok(())
    }

    fn check_timestamp(&self, ev: &Event, now: i64) -> Result<(), RejectReason> {
        if ev.created_at < now - self.max_past_skew || ev.created_at > now + self.max_future_skew {
            return Err(RejectReason::TimestampOutOfRange(ev.created_at));
        }
        Ok(())
    }

    fn check_id(&self, ev: &Event) -> Result<(), RejectReason> {
        let hash = ev.digest().map_err(|_| RejectReason::InvalidId)?;
        if hex::encode(hash) != ev.id {
            return Err(RejectReason::InvalidId);
        }
        Ok(())
    }
}

/// Verify the event's Schnorr signature against its pubkey and id digest.
fn check_signature(ev: &Event) -> Result<(), RejectReason> {
    let hash = ev.digest().map_err(|_| RejectReason::BadSignature)?;
    let sig_bytes = hex::decode(&ev.sig).map_err(|_| RejectReason::BadSignature)?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|_| RejectReason::BadSignature)?;
    let pk_bytes = hex::decode(&ev.pubkey).map_err(|_| RejectReason::BadSignature)?;
    let pk = XOnlyPublicKey::from_slice(&pk_bytes).map_err(|_| RejectReason::BadSignature)?;
    let msg = Message::from_digest_slice(&hash).map_err(|_| RejectReason::BadSignature)?;
    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|_| RejectReason::BadSignature)
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
