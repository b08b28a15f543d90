//! Deciding whether a mount may be used as is, initialized, or must be reset
//!
//! A mount carries gateway state and (once marked) the fingerprint of the
//! credentials that own it. Comparing that against the cluster Secret tells
//! a fresh mount from our own from one owned by some other gateway instance.
//! Resetting destroys whatever the other instance stored, so it is only
//! allowed with explicit authorization.

use std::fmt;

use fsbackup_common::{Error, Result};

use crate::config::FileSystemConfig;
use crate::integrity::CheckOutput;
use crate::secret::GatewaySecret;

/// Why a mount cannot be used without a reset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationReason {
    /// Gateway state is present but was never marked with a fingerprint
    LegacyMount,
    /// Gateway state is present but this cluster has no credentials for it
    UnknownOwner,
    /// The recorded fingerprint belongs to different credentials
    ForeignOwner,
}

impl fmt::Display for MigrationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MigrationReason::LegacyMount => {
                "it holds gateway data that was never marked with an owner, \
                 so it may belong to another gateway instance"
            }
            MigrationReason::UnknownOwner => {
                "it holds gateway data but this cluster has no gateway credentials, \
                 so it belongs to another gateway instance"
            }
            MigrationReason::ForeignOwner => {
                "it holds gateway data owned by another gateway instance"
            }
        })
    }
}

/// What the *check* probe found, relative to this cluster's credentials
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountState {
    /// No gateway state on the mount
    Unconfigured,
    /// Gateway state owned by the current credentials
    Consistent,
    /// Gateway state owned by someone else
    MigrationRequired {
        /// Why ownership could not be established
        reason: MigrationReason,
    },
}

/// Classify a mount from its probe output and the cluster Secret
pub fn decide(check: &CheckOutput, cluster_secret: Option<&GatewaySecret>) -> MountState {
    if !check.has_gateway_config {
        return MountState::Unconfigured;
    }
    let recorded = check.keys_fingerprint.trim();
    if recorded.is_empty() {
        return MountState::MigrationRequired {
            reason: MigrationReason::LegacyMount,
        };
    }
    match cluster_secret {
        None => MountState::MigrationRequired {
            reason: MigrationReason::UnknownOwner,
        },
        Some(secret) if secret.fingerprint().matches(recorded) => MountState::Consistent,
        Some(_) => MountState::MigrationRequired {
            reason: MigrationReason::ForeignOwner,
        },
    }
}

/// Destructive and fingerprinting steps a deploy must take
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetPlan {
    /// Mount is ours; nothing to do
    Keep,
    /// Fresh mount; mark it with our fingerprint
    Initialize,
    /// Wipe the mount, then mark it
    Reset,
}

impl ResetPlan {
    /// The *reset* probe must run
    pub fn requires_reset(&self) -> bool {
        matches!(self, ResetPlan::Reset)
    }

    /// The *mark* probe must run
    pub fn requires_mark(&self) -> bool {
        !matches!(self, ResetPlan::Keep)
    }
}

/// Turn a mount state into a plan, refusing unauthorized resets
pub fn authorize(
    state: &MountState,
    force_reset: bool,
    config: &FileSystemConfig,
) -> Result<ResetPlan> {
    match state {
        MountState::Unconfigured => Ok(ResetPlan::Initialize),
        MountState::Consistent => Ok(ResetPlan::Keep),
        MountState::MigrationRequired { .. } if force_reset => Ok(ResetPlan::Reset),
        MountState::MigrationRequired { reason } => Err(Error::reset_required(
            config.path(),
            format!(
                "{} cannot be used because {}. Resetting it deletes that data; \
                 re-run with force reset to proceed",
                config.path(),
                reason
            ),
        )),
    }
}

/// Reject a mount the probe could not write to
///
/// `uid` is the UID the probe ran as, `None` when the platform assigns it.
pub fn ensure_writable(
    check: &CheckOutput,
    config: &FileSystemConfig,
    uid: Option<i64>,
) -> Result<()> {
    if check.writable {
        return Ok(());
    }
    let user = match uid {
        Some(uid) => format!("UID {}", uid),
        None => "the UID assigned by the platform".to_string(),
    };
    Err(Error::actionable(format!(
        "{} is not writable by {}; make the directory writable by that user and try again",
        config.path(),
        user
    )))
}
