//! Marketplace × action routing keys.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use listingsync_core::DomainError;

/// A sales channel the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marketplace {
    Ebay,
    Etsy,
    Shopify,
    Amazon,
}

impl Marketplace {
    pub const ALL: [Marketplace; 4] = [
        Marketplace::Ebay,
        Marketplace::Etsy,
        Marketplace::Shopify,
        Marketplace::Amazon,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::Ebay => "ebay",
            Marketplace::Etsy => "etsy",
            Marketplace::Shopify => "shopify",
            Marketplace::Amazon => "amazon",
        }
    }
}

impl core::fmt::Display for Marketplace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Marketplace {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Marketplace::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| DomainError::validation(format!("unknown marketplace '{s}'")))
    }
}

/// What a job does to a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCode {
    Publish,
    Update,
    Delete,
    Sync,
}

impl ActionCode {
    pub const ALL: [ActionCode; 4] = [
        ActionCode::Publish,
        ActionCode::Update,
        ActionCode::Delete,
        ActionCode::Sync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionCode::Publish => "publish",
            ActionCode::Update => "update",
            ActionCode::Delete => "delete",
            ActionCode::Sync => "sync",
        }
    }
}

impl core::fmt::Display for ActionCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionCode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        ActionCode::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| DomainError::validation(format!("unknown action code '{s}'")))
    }
}

/// Routing key for handlers: which marketplace, which action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKind {
    pub marketplace: Marketplace,
    pub action: ActionCode,
}

impl JobKind {
    pub fn new(marketplace: Marketplace, action: ActionCode) -> Self {
        Self {
            marketplace,
            action,
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.marketplace, self.action)
    }
}

impl FromStr for JobKind {
    type Err = DomainError;

    /// Parses the `marketplace.action` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (marketplace, action) = s
            .split_once('.')
            .ok_or_else(|| DomainError::validation(format!("job kind '{s}' is not marketplace.action")))?;
        Ok(Self::new(marketplace.parse()?, action.parse()?))
    }
}
