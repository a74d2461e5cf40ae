//! Parses a raw NFe/CTe/event XML blob into typed metadata (C2).
//!
//! A non-validating, read-only scan over the document using `quick-xml`'s
//! pull-parser event loop (the idiom the pack's XML-consuming crates use,
//! e.g. `FishySoftware-semantic-explorer`, `clockworklabs-SpacetimeDB`).
//! `kind` is derived from the root element's local name; field extraction
//! is then dispatched per kind following spec §4.2.

use crate::domain::{Direction, DocType};
use crate::errors::InspectError;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    NFe,
    CTe,
    EventNFe,
    EventCTe,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Inspection {
    pub kind: Kind,
    pub key: String,
    pub referenced_key: Option<String>,
    pub event_type: Option<String>,
    pub emission_ts: String,
    pub year_month: String,
    pub direction: Option<Direction>,
}

impl Inspection {
    pub fn doc_type(&self) -> Option<DocType> {
        match self.kind {
            Kind::NFe | Kind::EventNFe => Some(DocType::NFe),
            Kind::CTe | Kind::EventCTe => Some(DocType::CTe),
            Kind::Unknown => None,
        }
    }
}

/// Text and attribute scan: text content keyed by `(parent_tag, tag)`, and
/// the `id`/`Id` attribute keyed by tag. Good enough for flat-ish fiscal
/// XML where the same leaf tag (e.g. `CNPJ`) appears under distinct
/// well-known parents (`emit`, `dest`, `toma4`, ...).
struct Scan {
    root_name: String,
    text_by_path: HashMap<(String, String), String>,
    id_attr_by_tag: HashMap<String, String>,
    toma3_code: Option<String>,
}

fn local_name(qname: &[u8]) -> String {
    let s = String::from_utf8_lossy(qname);
    match s.rfind(':') {
        Some(idx) => s[idx + 1..].to_string(),
        None => s.to_string(),
    }
}

fn scan(bytes: &[u8]) -> Result<Scan, InspectError> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut root_name = String::new();
    let mut text_by_path = HashMap::new();
    let mut id_attr_by_tag = HashMap::new();
    let mut toma3_code: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                if root_name.is_empty() {
                    root_name = name.clone();
                }
                for attr in e.attributes().flatten() {
                    let attr_name = local_name(attr.key.as_ref());
                    if attr_name.eq_ignore_ascii_case("id") {
                        if let Ok(val) = attr.decode_and_unescape_value(&reader) {
                            id_attr_by_tag.insert(name.clone(), val.to_string());
                        }
                    }
                }
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                // Self-closing element: may carry the toma3/toma selector value directly
                // as text is absent; nothing to record beyond attributes (rare in practice).
                let name = local_name(e.name().as_ref());
                for attr in e.attributes().flatten() {
                    let attr_name = local_name(attr.key.as_ref());
                    if attr_name.eq_ignore_ascii_case("id") {
                        if let Ok(val) = attr.decode_and_unescape_value(&reader) {
                            id_attr_by_tag.insert(name.clone(), val.to_string());
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(tag), parent) = (
                    stack.last().cloned(),
                    stack.len().checked_sub(2).and_then(|i| stack.get(i)).cloned(),
                ) {
                    if let Ok(text) = t.unescape() {
                        let text = text.trim().to_string();
                        if !text.is_empty() {
                            let parent_key = parent.unwrap_or_default();
                            if tag == "toma3" || tag == "toma" {
                                toma3_code = Some(text.clone());
                            }
                            text_by_path.insert((parent_key, tag), text);
                        }
                    }
                }
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Err(e) => return Err(InspectError::UnreadableXml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if root_name.is_empty() {
        return Err(InspectError::UnreadableXml("no root element".to_string()));
    }

    Ok(Scan {
        root_name,
        text_by_path,
        id_attr_by_tag,
        toma3_code,
    })
}

fn strip_prefix(raw: &str, n: usize) -> String {
    raw.chars().skip(n).collect()
}

fn year_month_from_ts(ts: &str) -> Result<String, InspectError> {
    // Accept `YYYY-MM-DDTHH:MM:SS[+-HH:MM|Z]`.
    if ts.len() < 7 || ts.as_bytes()[4] != b'-' {
        return Err(InspectError::MissingFields {
            field: "emission timestamp",
        });
    }
    Ok(format!("{}/{}", &ts[0..4], &ts[5..7]))
}

/// Extracts typed metadata. `company_id` is the canonical (already
/// normalized) id of the company this XML was downloaded on behalf of, used
/// to determine `direction`.
pub fn inspect(bytes: &[u8], company_id: &str) -> Result<Inspection, InspectError> {
    let scan = scan(bytes)?;

    let kind = classify(&scan.root_name);

    match kind {
        Kind::NFe => inspect_nfe(&scan, company_id),
        Kind::CTe => inspect_cte(&scan, company_id),
        Kind::EventNFe => inspect_event(&scan, Kind::EventNFe),
        Kind::EventCTe => inspect_event(&scan, Kind::EventCTe),
        Kind::Unknown => Ok(Inspection {
            kind: Kind::Unknown,
            key: String::new(),
            referenced_key: None,
            event_type: None,
            emission_ts: String::new(),
            year_month: String::new(),
            direction: None,
        }),
    }
}

fn classify(root: &str) -> Kind {
    match root {
        "nfeProc" | "NFe" => Kind::NFe,
        "cteProc" | "CTe" => Kind::CTe,
        "procEventoNFe" | "eventoNFe" => Kind::EventNFe,
        "procEventoCTe" | "eventoCTe" => Kind::EventCTe,
        _ => Kind::Unknown,
    }
}

fn inspect_nfe(scan: &Scan, company_id: &str) -> Result<Inspection, InspectError> {
    let id_raw = scan
        .id_attr_by_tag
        .get("infNFe")
        .ok_or(InspectError::MissingFields { field: "infNFe id" })?;
    let key = strip_prefix(id_raw, 3);

    let dh_emi = scan
        .text_by_path
        .get(&("ide".to_string(), "dhEmi".to_string()))
        .cloned()
        .ok_or(InspectError::MissingFields { field: "dhEmi" })?;
    let year_month = year_month_from_ts(&dh_emi)?;

    let dest_cnpj = scan
        .text_by_path
        .get(&("dest".to_string(), "CNPJ".to_string()))
        .or_else(|| scan.text_by_path.get(&("dest".to_string(), "CPF".to_string())));
    let emit_cnpj = scan
        .text_by_path
        .get(&("emit".to_string(), "CNPJ".to_string()))
        .or_else(|| scan.text_by_path.get(&("emit".to_string(), "CPF".to_string())));

    let direction = if dest_cnpj.map(|s| s.as_str()) == Some(company_id) {
        Some(Direction::Entrada)
    } else if emit_cnpj.map(|s| s.as_str()) == Some(company_id) {
        Some(Direction::Saida)
    } else {
        None
    };

    Ok(Inspection {
        kind: Kind::NFe,
        key,
        referenced_key: None,
        event_type: None,
        emission_ts: dh_emi,
        year_month,
        direction,
    })
}

fn inspect_cte(scan: &Scan, company_id: &str) -> Result<Inspection, InspectError> {
    let id_raw = scan
        .id_attr_by_tag
        .get("infCte")
        .ok_or(InspectError::MissingFields { field: "infCte id" })?;
    let key = strip_prefix(id_raw, 3);

    let dh_emi = scan
        .text_by_path
        .get(&("ide".to_string(), "dhEmi".to_string()))
        .cloned()
        .ok_or(InspectError::MissingFields { field: "dhEmi" })?;
    let year_month = year_month_from_ts(&dh_emi)?;

    let get = |parent: &str, tag: &str| -> Option<&String> {
        scan.text_by_path.get(&(parent.to_string(), tag.to_string()))
    };

    // Priority: Tomador -> Emitente -> Destinatario -> Remetente/Expedidor -> Recebedor.
    let toma4 = get("toma4", "CNPJ").or_else(|| get("toma4", "CPF"));
    let tomador_is_company = if let Some(id) = toma4 {
        id.as_str() == company_id
    } else if let Some(code) = &scan.toma3_code {
        let mapped_parent = match code.as_str() {
            "0" => "rem",
            "1" => "exped",
            "2" => "receb",
            "3" => "dest",
            _ => "",
        };
        if mapped_parent.is_empty() {
            false
        } else {
            get(mapped_parent, "CNPJ")
                .or_else(|| get(mapped_parent, "CPF"))
                .map(|id| id.as_str() == company_id)
                .unwrap_or(false)
        }
    } else {
        false
    };

    let direction = if tomador_is_company {
        Some(Direction::Entrada)
    } else if get("emit", "CNPJ").or_else(|| get("emit", "CPF")).map(|s| s.as_str())
        == Some(company_id)
    {
        Some(Direction::Saida)
    } else if get("dest", "CNPJ").or_else(|| get("dest", "CPF")).map(|s| s.as_str())
        == Some(company_id)
    {
        Some(Direction::Entrada)
    } else if get("rem", "CNPJ").or_else(|| get("rem", "CPF")).map(|s| s.as_str())
        == Some(company_id)
        || get("exped", "CNPJ").or_else(|| get("exped", "CPF")).map(|s| s.as_str())
            == Some(company_id)
    {
        Some(Direction::Saida)
    } else if get("receb", "CNPJ").or_else(|| get("receb", "CPF")).map(|s| s.as_str())
        == Some(company_id)
    {
        Some(Direction::Entrada)
    } else {
        None
    };

    Ok(Inspection {
        kind: Kind::CTe,
        key,
        referenced_key: None,
        event_type: None,
        emission_ts: dh_emi,
        year_month,
        direction,
    })
}

fn inspect_event(scan: &Scan, kind: Kind) -> Result<Inspection, InspectError> {
    let id_raw = scan
        .id_attr_by_tag
        .get("infEvento")
        .ok_or(InspectError::MissingFields {
            field: "infEvento id",
        })?;
    let key = strip_prefix(id_raw, 2);

    let referenced_key = scan
        .text_by_path
        .get(&("infEvento".to_string(), "chNFe".to_string()))
        .or_else(|| scan.text_by_path.get(&("infEvento".to_string(), "chCTe".to_string())))
        .cloned()
        .ok_or(InspectError::MissingFields {
            field: "chNFe/chCTe",
        })?;

    let event_type = scan
        .text_by_path
        .get(&("infEvento".to_string(), "tpEvento".to_string()))
        .cloned()
        .ok_or(InspectError::MissingFields { field: "tpEvento" })?;

    let dh_evento = scan
        .text_by_path
        .get(&("infEvento".to_string(), "dhEvento".to_string()))
        .cloned()
        .ok_or(InspectError::MissingFields { field: "dhEvento" })?;
    let year_month = year_month_from_ts(&dh_evento)?;

    let direction = if matches!(kind, Kind::EventNFe) && referenced_key.len() >= 22 {
        match &referenced_key[20..22] {
            "55" => Some(Direction::Saida),
            "65" => Some(Direction::Entrada),
            _ => None,
        }
    } else {
        None
    };

    Ok(Inspection {
        kind,
        key,
        referenced_key: Some(referenced_key),
        event_type: Some(event_type),
        emission_ts: dh_evento,
        year_month,
        direction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NFE_SAIDA: &str = r#"<?xml version="1.0"?>
<nfeProc>
  <NFe>
    <infNFe Id="NFe35240112345678000195550010000000011234567890">
      <ide><dhEmi>2024-04-10T10:00:00-03:00</dhEmi></ide>
      <emit><CNPJ>12345678000195</CNPJ></emit>
      <dest><CNPJ>98765432000100</CNPJ></dest>
    </infNFe>
  </NFe>
</nfeProc>"#;

    #[test]
    fn inspects_nfe_emitente_as_saida() {
        let r = inspect(NFE_SAIDA.as_bytes(), "12345678000195").unwrap();
        assert_eq!(r.kind, Kind::NFe);
        assert_eq!(r.key, "35240112345678000195550010000000011234567890");
        assert_eq!(r.year_month, "2024/04");
        assert_eq!(r.direction, Some(Direction::Saida));
    }

    #[test]
    fn inspects_nfe_destinatario_as_entrada() {
        let r = inspect(NFE_SAIDA.as_bytes(), "98765432000100").unwrap();
        assert_eq!(r.direction, Some(Direction::Entrada));
    }

    const EVENTO_CANC: &str = r#"<?xml version="1.0"?>
<procEventoNFe>
  <evento>
    <infEvento Id="ID110111352401123456780001955500100000000112345678901">
      <chNFe>35240112345678000195550010000000011234567890</chNFe>
      <tpEvento>110111</tpEvento>
      <dhEvento>2024-04-11T09:00:00-03:00</dhEvento>
    </infEvento>
  </evento>
</procEventoNFe>"#;

    #[test]
    fn inspects_cancel_event() {
        let r = inspect(EVENTO_CANC.as_bytes(), "12345678000195").unwrap();
        assert_eq!(r.kind, Kind::EventNFe);
        assert_eq!(
            r.referenced_key.as_deref(),
            Some("35240112345678000195550010000000011234567890")
        );
        assert_eq!(r.event_type.as_deref(), Some("110111"));
        assert_eq!(r.direction, Some(Direction::Saida));
    }

    #[test]
    fn unreadable_garbage_errors() {
        assert!(inspect(b"not xml at all", "x").is_err());
    }
}
