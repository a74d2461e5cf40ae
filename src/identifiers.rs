//! Company-identifier normalization and filesystem-safe folder names.
//!
//! Ported from `core/utils.py::normalize_cnpj` / `sanitize_folder_name` in
//! the original implementation: strip non-digits, drop a spreadsheet-float
//! trailing `.0`, left-pad truncated 13-digit CNPJs, and require the result
//! be 11 (CPF) or 14 (CNPJ) digits.

use crate::errors::IdentifierError;

/// Canonicalizes an 11- or 14-digit company identifier.
pub fn normalize(raw: &str) -> Result<String, IdentifierError> {
    let trimmed = raw.trim();
    let without_float_suffix = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    let digits: String = without_float_suffix
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();

    let digits = if digits.len() == 13 {
        format!("0{digits}")
    } else {
        digits
    };

    if digits.len() == 11 || digits.len() == 14 {
        Ok(digits)
    } else {
        Err(IdentifierError::InvalidIdentifier(raw.to_string()))
    }
}

/// Replaces Windows-hostile characters and trims hostile trailing chars.
///
/// Idempotent: `sanitize_folder(sanitize_folder(x)) == sanitize_folder(x)`.
pub fn sanitize_folder(name: &str) -> String {
    const INVALID: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

    let replaced: String = name
        .chars()
        .map(|c| if INVALID.contains(&c) { '_' } else { c })
        .collect();

    let trimmed = replaced.trim();
    trimmed
        .trim_end_matches(|c: char| c == '.' || c == ' ')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_non_digits() {
        assert_eq!(normalize("12.345.678/0001-95").unwrap(), "12345678000195");
    }

    #[test]
    fn normalize_drops_spreadsheet_float_suffix() {
        assert_eq!(normalize("12345678000195.0").unwrap(), "12345678000195");
    }

    #[test]
    fn normalize_pads_truncated_cnpj() {
        // 13 digits (leading zero lost by a spreadsheet) -> padded back to 14.
        assert_eq!(normalize("2345678000195").unwrap(), "02345678000195");
    }

    #[test]
    fn normalize_accepts_cpf() {
        assert_eq!(normalize("123.456.789-01").unwrap(), "12345678901");
    }

    #[test]
    fn normalize_rejects_bad_length() {
        assert!(normalize("123").is_err());
        assert!(normalize("123456789012").is_err());
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["12.345.678/0001-95", "123.456.789-01", "2345678000195.0"] {
            let once = normalize(raw).unwrap();
            let twice = normalize(&once).unwrap();
            assert_eq!(once, twice);
            assert!(matches!(once.len(), 11 | 14));
        }
    }

    #[test]
    fn sanitize_replaces_invalid_chars() {
        assert_eq!(sanitize_folder("EMPRESA S/A"), "EMPRESA S_A");
        assert_eq!(sanitize_folder("ARQUIVO:TESTE"), "ARQUIVO_TESTE");
    }

    #[test]
    fn sanitize_trims_trailing_dots_and_spaces() {
        assert_eq!(sanitize_folder("  FOLDER . . "), "FOLDER");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let name = "EMPRESA / \"S.A.\" ..";
        let once = sanitize_folder(name);
        let twice = sanitize_folder(&once);
        assert_eq!(once, twice);
    }
}
