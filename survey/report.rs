//! Console tables and TSV output for every result table.
//!
//! Undefined values are written as `NA` in both forms. TSV files carry one
//! header row and full-precision numbers; console tables are rounded.

use crate::balance::BalanceTable;
use crate::data::RespondentTable;
use crate::prevalence::{ArmSummary, ClusterOutcome};
use crate::reconcile::{ReconciledCount, Reconciliation};
use crate::scan::ScanRow;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Creates `path` and hands a buffered writer to `write`.
pub fn save<F>(path: &Path, write: F) -> Result<(), ReportError>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let wrap = |source: io::Error| ReportError::Write {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(wrap)?;
    let mut out = BufWriter::new(file);
    write(&mut out).and_then(|()| out.flush()).map_err(wrap)?;
    log::info!("Wrote '{}'", path.display());
    Ok(())
}

fn na(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| v.to_string())
}

fn na_fixed(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "NA".to_string(), |v| format!("{v:.precision$}"))
}

fn p_value_text(value: Option<f64>) -> String {
    match value {
        Some(p) if p < 1e-4 => format!("{p:.2e}"),
        other => na_fixed(other, 4),
    }
}

fn confidence_label(confidence: f64) -> String {
    format!("{}% CI", (confidence * 1000.0).round() / 10.0)
}

/// One row per respondent with every aggregate behind the reconciled count.
/// The count column uses the signed encoding, so no information is `-9`.
pub fn write_reconciliations<W: Write>(
    out: &mut W,
    table: &RespondentTable,
    rows: &[Reconciliation],
) -> io::Result<()> {
    writeln!(
        out,
        "respondent_id\tcluster\tarm\titemized_total\tcross_check_total\tlifetime_1\tlifetime_2\treconciled_count\tany_incident"
    )?;
    for (respondent, row) in table.respondents.iter().zip(rows) {
        let any = match row.count.any_incident() {
            Some(true) => "1",
            Some(false) => "0",
            None => "NA",
        };
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            respondent.id,
            respondent.cluster,
            respondent.arm,
            row.itemized_total,
            row.cross_check_total,
            row.lifetime[0],
            row.lifetime[1],
            row.count.encode(),
            any
        )?;
    }
    Ok(())
}

/// The normalized answers in signed form, one column per survey item.
/// Valid counts are written as-is; missing, refused and don't-know are `-1`,
/// `-2` and `-3`.
pub fn write_normalized<W: Write>(out: &mut W, table: &RespondentTable) -> io::Result<()> {
    writeln!(out, "respondent_id\tcluster\tarm\t{}", table.schema.items.join("\t"))?;
    for respondent in &table.respondents {
        write!(out, "{}\t{}\t{}", respondent.id, respondent.cluster, respondent.arm)?;
        for response in &respondent.responses {
            write!(out, "\t{}", response.encode())?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// How the reconciled counts break down, and how often the maximum came from
/// somewhere other than the itemized sum.
pub fn print_reconciliation_summary<W: Write>(
    out: &mut W,
    rows: &[Reconciliation],
) -> io::Result<()> {
    let no_information = rows
        .iter()
        .filter(|row| row.count == ReconciledCount::NoInformation)
        .count();
    let positive = rows
        .iter()
        .filter(|row| row.count.any_incident() == Some(true))
        .count();
    let zero = rows.len() - no_information - positive;
    let raised = rows
        .iter()
        .filter(|row| {
            row.count
                .count()
                .is_some_and(|count| count > row.itemized_total)
        })
        .count();

    writeln!(out, "{:<34} {:>8}", "Respondents", rows.len())?;
    writeln!(out, "{:<34} {:>8}", "At least one incident", positive)?;
    writeln!(out, "{:<34} {:>8}", "Confirmed zero", zero)?;
    writeln!(out, "{:<34} {:>8}", "No information", no_information)?;
    writeln!(out, "{:<34} {:>8}", "Count above itemized total", raised)?;
    Ok(())
}

pub fn write_cluster_outcomes<W: Write>(out: &mut W, rows: &[ClusterOutcome]) -> io::Result<()> {
    writeln!(
        out,
        "cluster\tarm\trespondents\tanswered\tno_information\tpositive\trate\tmean_count"
    )?;
    for row in rows {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            row.cluster,
            row.arm,
            row.respondents,
            row.tally.answered,
            row.respondents - row.tally.answered,
            row.tally.positive,
            na(row.rate()),
            na(row.mean_count)
        )?;
    }
    Ok(())
}

pub fn write_arm_summaries<W: Write>(
    out: &mut W,
    rows: &[ArmSummary],
    confidence: f64,
) -> io::Result<()> {
    writeln!(
        out,
        "group\tclusters\trespondents\tanswered\tpositive\tprevalence\tlower\tupper\tconfidence\tundefined_replicates"
    )?;
    for row in rows {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            row.label(),
            row.clusters,
            row.respondents,
            row.tally.answered,
            row.tally.positive,
            na(row.prevalence()),
            na(row.interval.map(|i| i.lower)),
            na(row.interval.map(|i| i.upper)),
            confidence,
            row.undefined_replicates
        )?;
    }
    Ok(())
}

pub fn print_arm_summaries<W: Write>(
    out: &mut W,
    rows: &[ArmSummary],
    confidence: f64,
) -> io::Result<()> {
    writeln!(
        out,
        "{:<10} | {:>8} | {:>11} | {:>8} | {:>8} | {:>10} | {:>17}",
        "Group",
        "Clusters",
        "Respondents",
        "Answered",
        "Positive",
        "Prevalence",
        confidence_label(confidence)
    )?;
    writeln!(out, "{}", "-".repeat(90))?;
    for row in rows {
        let interval = match row.interval {
            Some(i) => format!("[{:.3}, {:.3}]", i.lower, i.upper),
            None => "NA".to_string(),
        };
        writeln!(
            out,
            "{:<10} | {:>8} | {:>11} | {:>8} | {:>8} | {:>10} | {:>17}",
            row.label(),
            row.clusters,
            row.respondents,
            row.tally.answered,
            row.tally.positive,
            na_fixed(row.prevalence(), 3),
            interval
        )?;
    }
    Ok(())
}

pub fn write_balance<W: Write>(out: &mut W, table: &BalanceTable) -> io::Result<()> {
    writeln!(
        out,
        "covariate\tn_treatment\tmean_treatment\tsd_treatment\tn_control\tmean_control\tsd_control\tdifference\tstandardized_difference\tp_value"
    )?;
    for row in &table.rows {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            row.covariate,
            row.treatment.n,
            na(row.treatment.mean),
            na(row.treatment.std_dev),
            row.control.n,
            na(row.control.mean),
            na(row.control.std_dev),
            na(row.difference),
            na(row.standardized_difference),
            na(row.p_value)
        )?;
    }
    Ok(())
}

pub fn print_balance<W: Write>(out: &mut W, table: &BalanceTable) -> io::Result<()> {
    writeln!(
        out,
        "Treatment: {} clusters, {} respondents. Control: {} clusters, {} respondents.",
        table.treatment_clusters,
        table.treatment_respondents,
        table.control_clusters,
        table.control_respondents
    )?;
    writeln!(
        out,
        "{:<20} | {:>17} | {:>17} | {:>8} | {:>8} | {:>9}",
        "Covariate", "Treatment (sd)", "Control (sd)", "Diff", "SMD", "p"
    )?;
    writeln!(out, "{}", "-".repeat(94))?;
    let cell = |mean: Option<f64>, sd: Option<f64>| match mean {
        Some(mean) => format!("{mean:.2} ({})", na_fixed(sd, 2)),
        None => "NA".to_string(),
    };
    for row in &table.rows {
        writeln!(
            out,
            "{:<20} | {:>17} | {:>17} | {:>8} | {:>8} | {:>9}",
            row.covariate,
            cell(row.treatment.mean, row.treatment.std_dev),
            cell(row.control.mean, row.control.std_dev),
            na_fixed(row.difference, 3),
            na_fixed(row.standardized_difference, 3),
            p_value_text(row.p_value)
        )?;
    }
    Ok(())
}

pub fn write_scan<W: Write>(out: &mut W, rows: &[ScanRow]) -> io::Result<()> {
    writeln!(
        out,
        "predictor\tkind\tn\tp_value\tdirection\tstatistic\tlevels\tmean\tmin\tmax\tsd\tnote"
    )?;
    for row in rows {
        let summary = row.summary;
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            row.predictor,
            row.kind.label(),
            row.n,
            na(row.p_value),
            row.direction,
            na(row.statistic),
            row.levels.map_or_else(|| "NA".to_string(), |k| k.to_string()),
            na(summary.map(|s| s.mean)),
            na(summary.map(|s| s.min)),
            na(summary.map(|s| s.max)),
            na(summary.and_then(|s| s.std_dev)),
            row.note.as_deref().unwrap_or("")
        )?;
    }
    Ok(())
}

pub fn print_scan<W: Write>(out: &mut W, rows: &[ScanRow]) -> io::Result<()> {
    writeln!(
        out,
        "{:<24} | {:>11} | {:>4} | {:>9} | {:>3} | {:>10} | {:>10} | {:>10} | {:>10}",
        "Predictor", "Kind", "n", "p", "Dir", "Mean", "Min", "Max", "SD"
    )?;
    writeln!(out, "{}", "-".repeat(114))?;
    for row in rows {
        let summary = row.summary;
        writeln!(
            out,
            "{:<24} | {:>11} | {:>4} | {:>9} | {:>3} | {:>10} | {:>10} | {:>10} | {:>10}",
            row.predictor,
            row.kind.label(),
            row.n,
            p_value_text(row.p_value),
            row.direction,
            na_fixed(summary.map(|s| s.mean), 3),
            na_fixed(summary.map(|s| s.min), 3),
            na_fixed(summary.map(|s| s.max), 3),
            na_fixed(summary.and_then(|s| s.std_dev), 3)
        )?;
        if let Some(note) = &row.note {
            writeln!(out, "{:<24}   ({note})", "")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{Interval, Tally};
    use crate::config::Arm;
    use crate::scan::Direction;
    use crate::schools::FeatureKind;

    fn text(render: impl FnOnce(&mut Vec<u8>) -> io::Result<()>) -> String {
        let mut buffer = Vec::new();
        render(&mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn undefined_values_are_written_as_na() {
        let rows = [ClusterOutcome {
            cluster: "S4".into(),
            arm: Arm::Control,
            respondents: 3,
            tally: Tally::default(),
            mean_count: None,
        }];
        let output = text(|out| write_cluster_outcomes(out, &rows));
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "S4\tcontrol\t3\t0\t3\t0\tNA\tNA");
    }

    #[test]
    fn arm_summary_tsv_carries_interval_bounds() {
        let rows = [ArmSummary {
            arm: Some(Arm::Treatment),
            clusters: 2,
            respondents: 5,
            tally: Tally {
                positive: 2,
                answered: 5,
            },
            interval: Some(Interval {
                lower: 0.25,
                upper: 0.5,
            }),
            undefined_replicates: 0,
        }];
        let output = text(|out| write_arm_summaries(out, &rows, 0.95));
        assert!(output.starts_with("group\tclusters"));
        assert!(output.contains("treatment\t2\t5\t5\t2\t0.4\t0.25\t0.5\t0.95\t0\n"));

        let console = text(|out| print_arm_summaries(out, &rows, 0.95));
        assert!(console.contains("95% CI"));
        assert!(console.contains("[0.250, 0.500]"));
    }

    #[test]
    fn reconciliation_summary_counts_each_outcome() {
        let row = |itemized_total, count| Reconciliation {
            itemized_total,
            cross_check_total: itemized_total,
            lifetime: [0, 0],
            count,
        };
        let rows = [
            row(2, ReconciledCount::Count(2)),
            row(0, ReconciledCount::Count(3)),
            row(0, ReconciledCount::Count(0)),
            row(0, ReconciledCount::NoInformation),
        ];
        let output = text(|out| print_reconciliation_summary(out, &rows));
        let value = |label: &str| -> usize {
            let line = output
                .lines()
                .find(|line| line.starts_with(label))
                .unwrap();
            line.split_whitespace().last().unwrap().parse().unwrap()
        };
        assert_eq!(value("Respondents"), 4);
        assert_eq!(value("At least one incident"), 2);
        assert_eq!(value("Confirmed zero"), 1);
        assert_eq!(value("No information"), 1);
        assert_eq!(value("Count above itemized total"), 1);
    }

    #[test]
    fn scan_rows_keep_their_notes() {
        let rows = [ScanRow {
            predictor: "shift".into(),
            kind: FeatureKind::Numeric,
            n: 5,
            p_value: None,
            direction: Direction::NotApplicable,
            statistic: None,
            summary: None,
            levels: None,
            note: Some("The predictor has the same value for every observation.".into()),
        }];
        let output = text(|out| write_scan(out, &rows));
        assert!(output.lines().nth(1).unwrap().starts_with("shift\tnumeric\t5\tNA\tNA\tNA"));
        assert!(output.contains("same value"));
        let console = text(|out| print_scan(out, &rows));
        assert!(console.contains("(The predictor has the same value"));
    }

    #[test]
    fn normalized_answers_use_signed_codes() {
        use crate::codes::Response;
        use crate::data::{Respondent, RespondentSchema};

        let table = RespondentTable {
            schema: RespondentSchema {
                items: vec!["hit".into(), "kick".into(), "life_a".into(), "life_b".into()],
                itemized: vec![0, 1],
                lifetime: [2, 3],
                balance: vec![],
            },
            respondents: vec![Respondent {
                id: "r7".into(),
                cluster: "S2".into(),
                arm: Arm::Control,
                responses: vec![
                    Response::Valid(4),
                    Response::Missing,
                    Response::Refused,
                    Response::DontKnow,
                ],
            }],
        };
        let output = text(|out| write_normalized(out, &table));
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "respondent_id\tcluster\tarm\thit\tkick\tlife_a\tlife_b");
        assert_eq!(lines[1], "r7\tS2\tcontrol\t4\t-1\t-2\t-3");
    }

    #[test]
    fn small_p_values_use_scientific_notation() {
        assert_eq!(p_value_text(Some(0.0312)), "0.0312");
        assert_eq!(p_value_text(Some(0.000012)), "1.20e-5");
        assert_eq!(p_value_text(None), "NA");
        assert_eq!(confidence_label(0.9), "90% CI");
    }
}
