//! Core domain model for the grants exporter.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "grants-core";

pub const DEFAULT_SEARCH_URL: &str =
    "https://micro.grants.gov/rest/opportunities/search_export_Mark2";

/// One grant opportunity as returned by the search export, keyed by column name.
pub type OpportunityRecord = Map<String, JsonValue>;

/// Fields a record must carry with a non-empty value to survive cleaning.
pub const REQUIRED_FIELDS: [&str; 4] = [
    "OPPORTUNITY_NUMBER",
    "OPPORTUNITY_ID",
    "OPPORTUNITY_NUMBER_LINK",
    "OPPORTUNITY_TITLE",
];

/// Columns excluded from the cleaned export regardless of value.
pub const DROPPED_FIELDS: [&str; 4] = [
    "SYNOPSIS_ARCHIVED",
    "VERSION",
    "LAST_UPDATED_DATETIME",
    "OPPORTUNITY_PACKAGE",
];

/// Optional columns whose blanks are replaced by [`NOT_PROVIDED`].
pub const FILLABLE_FIELDS: [&str; 12] = [
    "GRANTOR_CONTACT",
    "GRANTOR_CONTACT_PHONE",
    "GRANTOR_CONTACT_EMAIL",
    "LINK_TO_ADDITIONAL_INFORMATION",
    "CATEGORY_OF_FUNDING_ACTIVITY",
    "FUNDING_CATEGORY_EXPLANATION",
    "FUNDING_INSTRUMENT_TYPE",
    "ASSISTANCE_LISTINGS",
    "ESTIMATED_TOTAL_FUNDING",
    "EXPECTED_NUMBER_OF_AWARDS",
    "AWARD_CEILING",
    "AWARD_FLOOR",
];

/// Textual values that mean "no data" in fillable columns.
pub const NOT_APPLICABLE_TOKENS: [&str; 4] = ["", "N/A", "n/a", "NA"];

pub const POSTED_DATE: &str = "POSTED_DATE";
pub const ESTIMATED_POST_DATE: &str = "ESTIMATED_POST_DATE";

pub const NOT_PROVIDED: &str = "Not Provided";
pub const ALREADY_POSTED: &str = "Opportunity already posted";

/// Search filter posted to the export endpoint. Every field is serialized, `None` as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPayload {
    pub keyword: Option<String>,
    pub cfda: Option<String>,
    pub agencies: Option<String>,
    pub sort_by: Option<String>,
    pub rows: Option<u32>,
    pub eligibilities: Option<String>,
    pub funding_categories: Option<String>,
    pub funding_instruments: Option<String>,
    pub date_range: Option<String>,
    pub opp_statuses: Option<String>,
}

impl Default for SearchPayload {
    fn default() -> Self {
        Self {
            keyword: None,
            cfda: None,
            agencies: None,
            sort_by: Some("openDate|desc".to_string()),
            rows: Some(5000),
            eligibilities: None,
            funding_categories: None,
            funding_instruments: None,
            date_range: Some(String::new()),
            opp_statuses: Some("forecasted|posted".to_string()),
        }
    }
}

/// True when a value carries data: not `null` and not an empty string.
pub fn is_present(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Serialize with `indent_width` spaces per level. Non-ASCII text is written unescaped.
pub fn to_pretty_json<T: Serialize + ?Sized>(
    value: &T,
    indent_width: usize,
) -> serde_json::Result<Vec<u8>> {
    let indent = vec![b' '; indent_width];
    let formatter = serde_json::ser::PrettyFormatter::with_indent(&indent);
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}
