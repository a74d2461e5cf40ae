//! Shared entity types: `Company`, `MonthKey`, `DocType`, `Role`, keys.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Company {
    pub id_canonical: String,
    pub folder_name: String,
}

/// `"MM-YYYY"`, the primary partition key for state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthKey(String);

impl MonthKey {
    /// Accepts `MM-YYYY` or `YYYY-MM` and canonicalizes to `MM-YYYY`.
    pub fn parse(raw: &str) -> Result<Self, crate::errors::StateError> {
        let parts: Vec<&str> = raw.split('-').collect();
        if parts.len() != 2 {
            return Err(crate::errors::StateError::InvalidMonthKey(raw.to_string()));
        }
        let (a, b) = (parts[0], parts[1]);
        let as_mm_yyyy = |mm: &str, yyyy: &str| -> Option<String> {
            if mm.len() == 2
                && yyyy.len() == 4
                && mm.chars().all(|c| c.is_ascii_digit())
                && yyyy.chars().all(|c| c.is_ascii_digit())
            {
                let mm_val: u32 = mm.parse().ok()?;
                if (1..=12).contains(&mm_val) {
                    return Some(format!("{mm}-{yyyy}"));
                }
            }
            None
        };

        // MM-YYYY
        if let Some(canon) = as_mm_yyyy(a, b) {
            return Ok(MonthKey(canon));
        }
        // YYYY-MM
        if let Some(canon) = as_mm_yyyy(b, a) {
            return Ok(MonthKey(canon));
        }
        Err(crate::errors::StateError::InvalidMonthKey(raw.to_string()))
    }

    pub fn from_year_month(year: i32, month: u32) -> Self {
        MonthKey(format!("{month:02}-{year:04}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn month(&self) -> u32 {
        self.0[0..2].parse().expect("canonicalized at construction")
    }

    pub fn year(&self) -> i32 {
        self.0[3..7].parse().expect("canonicalized at construction")
    }

    /// Returns the `(year, month)` pair one calendar month earlier.
    pub fn previous(&self) -> Self {
        let (y, m) = (self.year(), self.month());
        if m == 1 {
            Self::from_year_month(y - 1, 12)
        } else {
            Self::from_year_month(y, m - 1)
        }
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocType {
    NFe,
    CTe,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::NFe => "NFe",
            DocType::CTe => "CTe",
        }
    }

    /// XML type code as used by the upstream API (1 = NFe, 2 = CTe).
    pub fn xml_type_code(&self) -> u8 {
        match self {
            DocType::NFe => 1,
            DocType::CTe => 2,
        }
    }

    /// Infers doc type from positions 21-22 (0-indexed 20..22) of a 44-digit key.
    /// `55` -> NFe, `57` -> CTe, otherwise defaults to NFe.
    pub fn from_key_model(key: &str) -> Self {
        if key.len() >= 22 {
            match &key[20..22] {
                "57" => return DocType::CTe,
                "55" => return DocType::NFe,
                _ => {}
            }
        }
        DocType::NFe
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Emitente,
    Destinatario,
    Tomador,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Emitente => "Emitente",
            Role::Destinatario => "Destinatario",
            Role::Tomador => "Tomador",
        }
    }

    /// Upstream batch-download filter field name for this role.
    pub fn upstream_field(&self) -> &'static str {
        match self {
            Role::Emitente => "CnpjEmit",
            Role::Destinatario => "CnpjDest",
            Role::Tomador => "CnpjTom",
        }
    }

    /// Roles applicable to a given doc type (Tomador is CTe-only).
    pub fn applicable_for(doc_type: DocType) -> &'static [Role] {
        match doc_type {
            DocType::NFe => &[Role::Emitente, Role::Destinatario],
            DocType::CTe => &[Role::Emitente, Role::Destinatario, Role::Tomador],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Entrada,
    Saida,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Entrada => "Entrada",
            Direction::Saida => "Sa\u{00ed}da",
        }
    }
}

/// Validates a document/event key is exactly 44 decimal digits.
pub fn is_valid_key(key: &str) -> bool {
    key.len() == 44 && key.chars().all(|c| c.is_ascii_digit())
}

/// Cancel-event `tpEvento` codes that represent cancellations.
pub const CANCEL_EVENT_TYPES: [&str; 3] = ["110111", "110112", "610601"];

pub fn is_cancel_event(event_type: &str) -> bool {
    CANCEL_EVENT_TYPES.contains(&event_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_key_canonicalizes_both_orders() {
        assert_eq!(MonthKey::parse("04-2024").unwrap().as_str(), "04-2024");
        assert_eq!(MonthKey::parse("2024-04").unwrap().as_str(), "04-2024");
    }

    #[test]
    fn month_key_rejects_garbage() {
        assert!(MonthKey::parse("not-a-month").is_err());
        assert!(MonthKey::parse("13-2024").is_err());
    }

    #[test]
    fn month_key_previous_wraps_year() {
        let jan = MonthKey::from_year_month(2024, 1);
        assert_eq!(jan.previous().as_str(), "12-2023");
    }

    #[test]
    fn doc_type_from_key_model() {
        let nfe_key = format!("{}{}{}", "0".repeat(20), "55", "0".repeat(22));
        let cte_key = format!("{}{}{}", "0".repeat(20), "57", "0".repeat(22));
        assert_eq!(DocType::from_key_model(&nfe_key), DocType::NFe);
        assert_eq!(DocType::from_key_model(&cte_key), DocType::CTe);
    }

    #[test]
    fn key_validity() {
        assert!(is_valid_key(&"1".repeat(44)));
        assert!(!is_valid_key(&"1".repeat(43)));
        assert!(!is_valid_key("abcd"));
    }
}
