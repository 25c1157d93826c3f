//! Core domain model for CREX: listings, change records, scrape runs,
//! and the raw-record normalizer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "crex-core";

/// Untrusted field bag handed over by a source adapter. All fields are
/// freeform marketing text; nothing here has been trimmed or validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub property_name: Option<String>,
    pub address: Option<String>,
    pub floor_suite: Option<String>,
    pub space_available: Option<String>,
    pub price: Option<String>,
    pub listing_url: Option<String>,
}

/// Canonical persisted listing row. `id` is a surrogate assigned on first
/// insert; identity across scrape runs is the [`ListingKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub source: String,
    pub property_name: Option<String>,
    pub address: Option<String>,
    pub floor_suite: Option<String>,
    pub space_available: Option<String>,
    pub price: Option<String>,
    pub listing_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    /// Best-effort identity of this listing within its source: the listing
    /// URL when present, otherwise the (property_name, floor_suite) pair.
    pub fn key(&self) -> ListingKey {
        match normalized(self.listing_url.as_deref()) {
            Some(url) => ListingKey::Url(url.to_string()),
            None => ListingKey::NameSuite {
                property_name: normalized(self.property_name.as_deref())
                    .unwrap_or_default()
                    .to_string(),
                floor_suite: normalized(self.floor_suite.as_deref())
                    .unwrap_or_default()
                    .to_string(),
            },
        }
    }

    pub fn field_value(&self, field: FieldName) -> Option<&str> {
        match field {
            FieldName::PropertyName => self.property_name.as_deref(),
            FieldName::Address => self.address.as_deref(),
            FieldName::FloorSuite => self.floor_suite.as_deref(),
            FieldName::SpaceAvailable => self.space_available.as_deref(),
            FieldName::Price => self.price.as_deref(),
        }
    }
}

/// Matching key for a listing within one source. Not the database primary
/// key: rows keep their surrogate id while this key decides whether two
/// sightings are the same listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListingKey {
    Url(String),
    NameSuite {
        property_name: String,
        floor_suite: String,
    },
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListingKey::Url(url) => write!(f, "{url}"),
            ListingKey::NameSuite {
                property_name,
                floor_suite,
            } => write!(f, "{property_name}|{floor_suite}"),
        }
    }
}

/// The listing attributes compared during reconciliation. The listing URL
/// is excluded: it is (part of) the identity key, not a tracked field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    PropertyName,
    Address,
    FloorSuite,
    SpaceAvailable,
    Price,
}

impl FieldName {
    pub const COMPARED: [FieldName; 5] = [
        FieldName::PropertyName,
        FieldName::Address,
        FieldName::FloorSuite,
        FieldName::SpaceAvailable,
        FieldName::Price,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::PropertyName => "property_name",
            FieldName::Address => "address",
            FieldName::FloorSuite => "floor_suite",
            FieldName::SpaceAvailable => "space_available",
            FieldName::Price => "price",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "property_name" => Some(FieldName::PropertyName),
            "address" => Some(FieldName::Address),
            "floor_suite" => Some(FieldName::FloorSuite),
            "space_available" => Some(FieldName::SpaceAvailable),
            "price" => Some(FieldName::Price),
            _ => None,
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field-level mutation, append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub source: String,
    pub field: FieldName,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(RunStatus::Success),
            "partial" => Some(RunStatus::Partial),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per scrape attempt, immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: Uuid,
    pub source: String,
    pub status: RunStatus,
    pub properties_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("record from {source_id} has no listing_url, property_name or floor_suite")]
    NoIdentity { source_id: String },
}

/// Trim-then-collapse: whitespace-only and empty both read as missing, so
/// `""` in persisted state and an absent incoming field compare equal.
pub fn normalized(value: Option<&str>) -> Option<&str> {
    match value {
        Some(v) => {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        }
        None => None,
    }
}

fn clean(value: Option<String>) -> Option<String> {
    normalized(value.as_deref()).map(ToString::to_string)
}

/// Coerce a raw scraped record into a canonical [`Listing`].
///
/// Fails only when the record carries no usable identity at all: no
/// listing URL and neither half of the fallback key.
pub fn normalize(
    raw: RawListing,
    source: &str,
    now: DateTime<Utc>,
) -> Result<Listing, ValidationError> {
    let listing_url = clean(raw.listing_url);
    let property_name = clean(raw.property_name);
    let floor_suite = clean(raw.floor_suite);

    if listing_url.is_none() && property_name.is_none() && floor_suite.is_none() {
        return Err(ValidationError::NoIdentity {
            source_id: source.to_string(),
        });
    }

    Ok(Listing {
        id: Uuid::new_v4(),
        source: source.to_string(),
        property_name,
        address: clean(raw.address),
        floor_suite,
        space_available: clean(raw.space_available),
        price: clean(raw.price),
        listing_url,
        created_at: now,
        updated_at: now,
    })
}
