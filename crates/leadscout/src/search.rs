//! Search records and their phase/status state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseEnumError;

/// Whether the user is looking for customers or suppliers of the product.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Customer,
    Supplier,
}

impl Orientation {
    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Customer => "customer",
            Orientation::Supplier => "supplier",
        }
    }
}

impl FromStr for Orientation {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Orientation::Customer),
            "supplier" => Ok(Orientation::Supplier),
            other => Err(ParseEnumError::new("orientation", other)),
        }
    }
}

/// Overall status of a search run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SearchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchStatus::InProgress => "in_progress",
            SearchStatus::Completed => "completed",
            SearchStatus::Failed => "failed",
            SearchStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SearchStatus::InProgress)
    }
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(SearchStatus::InProgress),
            "completed" => Ok(SearchStatus::Completed),
            "failed" => Ok(SearchStatus::Failed),
            "cancelled" => Ok(SearchStatus::Cancelled),
            other => Err(ParseEnumError::new("search status", other)),
        }
    }
}

/// Pipeline phase. A phase names the last step that finished successfully,
/// so `Businesses` means business discovery is done and decision-maker
/// discovery is next.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SearchPhase {
    Starting,
    Personas,
    Businesses,
    DecisionMakers,
    MarketInsights,
    Completed,
    Failed,
    Cancelled,
}

impl SearchPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchPhase::Starting => "starting",
            SearchPhase::Personas => "personas",
            SearchPhase::Businesses => "businesses",
            SearchPhase::DecisionMakers => "decision_makers",
            SearchPhase::MarketInsights => "market_insights",
            SearchPhase::Completed => "completed",
            SearchPhase::Failed => "failed",
            SearchPhase::Cancelled => "cancelled",
        }
    }

    /// Progress written when the search enters this phase.
    pub fn progress_pct(self) -> u8 {
        match self {
            SearchPhase::Starting => 5,
            SearchPhase::Personas => 25,
            SearchPhase::Businesses => 60,
            SearchPhase::DecisionMakers => 85,
            SearchPhase::MarketInsights | SearchPhase::Completed => 100,
            SearchPhase::Failed | SearchPhase::Cancelled => 0,
        }
    }

    /// The phase reached after the next step succeeds.
    pub fn next(self) -> Option<SearchPhase> {
        match self {
            SearchPhase::Starting => Some(SearchPhase::Personas),
            SearchPhase::Personas => Some(SearchPhase::Businesses),
            SearchPhase::Businesses => Some(SearchPhase::DecisionMakers),
            SearchPhase::DecisionMakers => Some(SearchPhase::MarketInsights),
            SearchPhase::MarketInsights => Some(SearchPhase::Completed),
            SearchPhase::Completed | SearchPhase::Failed | SearchPhase::Cancelled => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SearchPhase::Completed | SearchPhase::Failed | SearchPhase::Cancelled
        )
    }
}

impl fmt::Display for SearchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchPhase {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(SearchPhase::Starting),
            "personas" => Ok(SearchPhase::Personas),
            "businesses" => Ok(SearchPhase::Businesses),
            "decision_makers" => Ok(SearchPhase::DecisionMakers),
            "market_insights" => Ok(SearchPhase::MarketInsights),
            "completed" => Ok(SearchPhase::Completed),
            "failed" => Ok(SearchPhase::Failed),
            "cancelled" => Ok(SearchPhase::Cancelled),
            other => Err(ParseEnumError::new("search phase", other)),
        }
    }
}

/// One user-initiated orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Search {
    pub id: String,
    pub owner_id: String,
    pub orientation: Orientation,
    pub product: String,
    pub industries: Vec<String>,
    pub countries: Vec<String>,
    pub status: SearchStatus,
    pub phase: SearchPhase,
    pub progress_pct: u8,
    /// Last failure message, cleared on retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request-intake payload for a new search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSearch {
    pub owner_id: String,
    pub orientation: Orientation,
    pub product: String,
    pub industries: Vec<String>,
    pub countries: Vec<String>,
}

impl NewSearch {
    /// Trims and validates the request, returning the first problem found.
    pub fn normalized(self) -> Result<Self, String> {
        let owner_id = self.owner_id.trim().to_string();
        if owner_id.is_empty() {
            return Err("owner id must not be empty".to_string());
        }
        let product = self.product.trim().to_string();
        if product.is_empty() {
            return Err("product description must not be empty".to_string());
        }
        let industries = normalize_list("industries", self.industries)?;
        let countries = normalize_list("countries", self.countries)?;

        Ok(Self {
            owner_id,
            orientation: self.orientation,
            product,
            industries,
            countries,
        })
    }

    /// Builds the stored record in its initial state.
    pub fn into_search(self, now: DateTime<Utc>) -> Search {
        Search {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: self.owner_id,
            orientation: self.orientation,
            product: self.product,
            industries: self.industries,
            countries: self.countries,
            status: SearchStatus::InProgress,
            phase: SearchPhase::Starting,
            progress_pct: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

fn normalize_list(field: &str, values: Vec<String>) -> Result<Vec<String>, String> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(format!("{} must not contain blank entries", field));
        }
        out.push(trimmed.to_string());
    }
    if out.is_empty() {
        return Err(format!("at least one entry is required in {}", field));
    }
    Ok(out)
}
