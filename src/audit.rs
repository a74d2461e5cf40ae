//! Appends a per-company, per-month human-readable audit summary.
//!
//! Line-based append-only text, no schema version, styled after the
//! tracing-field summaries `keeper-rs/src/main.rs` emits at the end of a
//! poll cycle, converted here into a flat file report instead of a log
//! line.

use crate::domain::{Company, DocType, MonthKey, Role};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DocTypeValidation {
    pub doc_type: DocType,
    pub manifest_count: usize,
    pub disk_count: usize,
    pub faltantes_valid: usize,
    pub ignored_faltantes: usize,
    pub extras: usize,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct IndividualDownloadStats {
    pub attempts: u32,
    pub successes: u32,
    pub download_failures: u32,
    pub save_failures: u32,
    pub retroactive_corrections: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AuditSummary {
    pub execution_ts: String,
    pub period: String,
    pub validations: Vec<DocTypeValidation>,
    pub report_counts_by_role: Vec<(DocType, Role, usize)>,
    pub local_dir_counts: HashMap<String, usize>,
    pub cancel_event_counts: HashMap<String, usize>,
    pub parse_errors: u64,
    pub info_errors: u64,
    pub save_errors: u64,
    pub individual: IndividualDownloadStats,
}

pub fn audit_path(primary_root: &Path, company: &Company, month: &MonthKey) -> PathBuf {
    primary_root
        .join(month.year().to_string())
        .join(&company.folder_name)
        .join(format!("{:02}", month.month()))
        .join(format!(
            "Resumo_Auditoria_{}_{}_{:02}.txt",
            company.folder_name,
            month.year(),
            month.month()
        ))
}

pub fn append_summary(
    primary_root: &Path,
    company: &Company,
    month: &MonthKey,
    summary: &AuditSummary,
) -> std::io::Result<()> {
    let path = audit_path(primary_root, company, month);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    writeln!(file, "=== Execucao: {} ===", summary.execution_ts)?;
    writeln!(file, "Empresa: {} ({})", company.folder_name, company.id_canonical)?;
    writeln!(file, "Periodo: {}", summary.period)?;

    for v in &summary.validations {
        let rate = if v.manifest_count > 0 {
            (v.disk_count as f64 / v.manifest_count as f64) * 100.0
        } else {
            100.0
        };
        writeln!(
            file,
            "{}: {}/{} OK ({:.0}%) | faltantes_validas={} ignorados={} extras={} status={}",
            v.doc_type.as_str(),
            v.disk_count,
            v.manifest_count,
            rate,
            v.faltantes_valid,
            v.ignored_faltantes,
            v.extras,
            v.status,
        )?;
    }

    for (doc_type, role, count) in &summary.report_counts_by_role {
        writeln!(file, "Relatorio {} / {}: {}", doc_type.as_str(), role.as_str(), count)?;
    }

    let mut dirs: Vec<_> = summary.local_dir_counts.iter().collect();
    dirs.sort_by_key(|(name, _)| name.to_string());
    for (dir, count) in dirs {
        writeln!(file, "Diretorio {dir}: {count} arquivos")?;
    }

    let mut cancels: Vec<_> = summary.cancel_event_counts.iter().collect();
    cancels.sort_by_key(|(name, _)| name.to_string());
    for (event_type, count) in cancels {
        writeln!(file, "Eventos de cancelamento {event_type}: {count}")?;
    }

    writeln!(
        file,
        "Erros: parse={} info={} save={}",
        summary.parse_errors, summary.info_errors, summary.save_errors
    )?;
    writeln!(
        file,
        "Recuperacao individual: tentativas={} sucesso={} falhas_download={} falhas_save={} correcoes_retroativas={}",
        summary.individual.attempts,
        summary.individual.successes,
        summary.individual.download_failures,
        summary.individual.save_failures,
        summary.individual.retroactive_corrections,
    )?;
    writeln!(file)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_block_without_truncating_prior_content() {
        let dir = tempfile::tempdir().unwrap();
        let company = Company {
            id_canonical: "12345678000195".to_string(),
            folder_name: "Empresa".to_string(),
        };
        let month = MonthKey::parse("04-2024").unwrap();
        let summary = AuditSummary {
            execution_ts: "2024-04-10T10:00:00Z".to_string(),
            period: "04-2024".to_string(),
            validations: vec![DocTypeValidation {
                doc_type: DocType::NFe,
                manifest_count: 3,
                disk_count: 3,
                faltantes_valid: 0,
                ignored_faltantes: 0,
                extras: 0,
                status: "OK".to_string(),
            }],
            ..Default::default()
        };

        append_summary(dir.path(), &company, &month, &summary).unwrap();
        append_summary(dir.path(), &company, &month, &summary).unwrap();

        let path = audit_path(dir.path(), &company, &month);
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.matches("=== Execucao").count(), 2);
        assert!(contents.contains("NFe: 3/3 OK (100%)"));
    }
}
