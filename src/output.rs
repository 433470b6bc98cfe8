use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    AttachStatus, BatchReport, CityDatasetsReport, GroupExportReport, GroupResolution,
    MaterializeReport, RunReport, TagListReport, TagMapReport,
};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// One-screen plain-text rendering of a step report.
pub trait Summary {
    fn summary_lines(&self) -> Vec<String>;
}

pub fn print_report<T: Serialize + Summary>(report: &T, mode: OutputMode) -> io::Result<()> {
    match mode {
        OutputMode::Json => JsonOutput::print(report),
        OutputMode::Human => {
            let mut stdout = io::stdout();
            for line in report.summary_lines() {
                writeln!(stdout, "{line}")?;
            }
            Ok(())
        }
    }
}

impl Summary for CityDatasetsReport {
    fn summary_lines(&self) -> Vec<String> {
        vec![format!(
            "{} cities, {} datasets written to {} ({} blank rows skipped)",
            self.cities, self.datasets, self.output, self.skipped_rows
        )]
    }
}

impl Summary for GroupExportReport {
    fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{}/{} groups exported to {}",
            self.groups_exported, self.groups_listed, self.output
        )];
        lines.extend(
            self.failures
                .iter()
                .map(|failure| format!("  skipped {} ({})", failure.name, failure.category)),
        );
        lines
    }
}

impl Summary for TagMapReport {
    fn summary_lines(&self) -> Vec<String> {
        vec![format!(
            "{} datasets, {} tag assignments written to {}",
            self.datasets, self.assignments, self.output
        )]
    }
}

impl Summary for TagListReport {
    fn summary_lines(&self) -> Vec<String> {
        vec![format!("{} tags written to {}", self.tags, self.output)]
    }
}

impl Summary for MaterializeReport {
    fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for city in &self.cities {
            let resolution = match &city.resolution {
                GroupResolution::Existing => "existing".to_string(),
                GroupResolution::Created => "created".to_string(),
                GroupResolution::AlreadyExisted => "existing (race)".to_string(),
                GroupResolution::Planned => "would create".to_string(),
                GroupResolution::Failed { reason } => format!("failed: {reason}"),
            };
            let attached = city
                .datasets
                .iter()
                .filter(|outcome| outcome.status == AttachStatus::Attached)
                .count();
            lines.push(format!(
                "{} -> {} [{}], {}/{} datasets attached",
                city.city,
                city.group,
                resolution,
                attached,
                city.datasets.len()
            ));
        }
        lines.push(format!("{} memberships created", self.attached()));
        lines
    }
}

impl Summary for BatchReport {
    fn summary_lines(&self) -> Vec<String> {
        vec![format!(
            "{} done, {} failed, {} total",
            self.succeeded(),
            self.failed(),
            self.items.len()
        )]
    }
}

impl Summary for RunReport {
    fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(step) = &self.city_datasets {
            lines.extend(step.summary_lines());
        }
        if let Some(step) = &self.materialize {
            lines.extend(step.summary_lines());
        }
        if let Some(step) = &self.group_export {
            lines.extend(step.summary_lines());
        }
        if let Some(step) = &self.tag_map {
            lines.extend(step.summary_lines());
        }
        if let Some(step) = &self.tag_patch {
            lines.push(format!("tag patch: {}", step.summary_lines().join(" ")));
        }
        lines.extend(self.errors.iter().map(|err| format!("error: {err}")));
        lines
    }
}
