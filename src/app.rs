use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::artifacts::{self, CITY_DATASETS_FILE, DATASET_TAGS_FILE, GROUP_EXPORT_FILE, TAG_LIST_FILE};
use crate::catalog::{Capacity, CatalogClient, NewGroup, datasets_for_city};
use crate::domain::{CityDatasetMap, CityRecord, DatasetTagMap, GroupExportEntry, GroupSlug, TagList};
use crate::error::MigrateError;
use crate::log::MigrationLog;
use crate::roster::{self, DEFAULT_ROSTER_FILE};

#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub roster: Utf8PathBuf,
    pub city_datasets: Utf8PathBuf,
    pub group_export: Utf8PathBuf,
    pub dataset_tags: Utf8PathBuf,
    pub tag_list: Utf8PathBuf,
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self {
            roster: Utf8PathBuf::from(DEFAULT_ROSTER_FILE),
            city_datasets: Utf8PathBuf::from(CITY_DATASETS_FILE),
            group_export: Utf8PathBuf::from(GROUP_EXPORT_FILE),
            dataset_tags: Utf8PathBuf::from(DATASET_TAGS_FILE),
            tag_list: Utf8PathBuf::from(TAG_LIST_FILE),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOptions {
    /// Issue reads only; mutations are reported as planned.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CityDatasetsReport {
    pub cities: usize,
    pub datasets: usize,
    pub skipped_rows: usize,
    pub output: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub name: String,
    pub category: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupExportReport {
    pub groups_listed: usize,
    pub groups_exported: usize,
    pub failures: Vec<ItemFailure>,
    pub output: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagMapReport {
    pub datasets: usize,
    pub assignments: usize,
    pub output: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupResolution {
    Existing,
    Created,
    /// Creation reported a duplicate name.
    AlreadyExisted,
    Planned,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttachStatus {
    Attached,
    Planned,
    NotFound,
    /// Validation rejected the membership, usually because it already exists.
    Rejected { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachOutcome {
    pub dataset: String,
    #[serde(flatten)]
    pub status: AttachStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CityOutcome {
    pub city: String,
    pub group: String,
    pub resolution: GroupResolution,
    pub datasets: Vec<AttachOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterializeReport {
    pub cities: Vec<CityOutcome>,
    pub finished_at: String,
}

impl MaterializeReport {
    pub fn attached(&self) -> usize {
        self.cities
            .iter()
            .flat_map(|city| &city.datasets)
            .filter(|outcome| outcome.status == AttachStatus::Attached)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Done,
    Planned,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub name: String,
    #[serde(flatten)]
    pub status: ItemStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub items: Vec<ItemOutcome>,
    pub finished_at: String,
}

impl BatchReport {
    fn new(items: Vec<ItemOutcome>) -> Self {
        Self {
            items,
            finished_at: iso_timestamp(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Done)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item.status, ItemStatus::Failed { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TagListReport {
    pub tags: usize,
    pub output: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub city_datasets: Option<CityDatasetsReport>,
    pub materialize: Option<MaterializeReport>,
    pub group_export: Option<GroupExportReport>,
    pub tag_map: Option<TagMapReport>,
    pub tag_patch: Option<BatchReport>,
    pub errors: Vec<String>,
}

/// Searches the source catalog once per roster city. Rows with a blank city
/// are skipped; a city with no matches still gets an empty list.
pub fn build_city_datasets(
    source: &dyn CatalogClient,
    roster: &[CityRecord],
    log: &dyn MigrationLog,
) -> CityDatasetMap {
    let mut map = CityDatasetMap::new();
    for record in roster {
        let city = record.city.trim();
        if city.is_empty() {
            continue;
        }
        log.info(&format!("Processing city: {city} ({})", record.label.trim()));
        let datasets = datasets_for_city(source, city, log);
        map.insert(city.to_string(), datasets);
    }
    map
}

/// Lists source groups and collects each group's member datasets in list
/// order. A failing group is logged and skipped; only a failing group list
/// is returned as an error.
pub fn export_groups(
    source: &dyn CatalogClient,
    log: &dyn MigrationLog,
) -> Result<(Vec<GroupExportEntry>, Vec<ItemFailure>), MigrateError> {
    log.info("Starting source group dataset fetch");
    let groups = source.list_groups()?;
    log.info(&format!("Found {} groups on source catalog", groups.len()));

    let mut entries = Vec::new();
    let mut failures = Vec::new();
    for group in groups {
        match source.show_group(&group.name) {
            Ok(detail) => {
                let datasets = detail.dataset_names();
                log.info(&format!(
                    "Fetched {} datasets for group '{}'",
                    datasets.len(),
                    group.name
                ));
                entries.push(GroupExportEntry {
                    group_name: group.name,
                    datasets,
                });
            }
            Err(err) => {
                let message = format!("Skipping group '{}' ({}): {err}", group.name, err.category());
                if err.is_not_found() {
                    log.warn(&message);
                } else {
                    log.error(&message);
                }
                failures.push(ItemFailure {
                    name: group.name,
                    category: err.category().to_string(),
                    message: err.to_string(),
                });
            }
        }
    }
    Ok((entries, failures))
}

/// Inverts the group export into dataset -> group names. Order follows the
/// export and duplicates are kept.
pub fn build_dataset_tags(entries: &[GroupExportEntry]) -> DatasetTagMap {
    let mut map = DatasetTagMap::new();
    for entry in entries {
        for dataset in &entry.datasets {
            map.push_tag(dataset, entry.group_name.clone());
        }
    }
    map
}

/// Ensures a target group per city and attaches the city's datasets to it.
pub fn materialize_groups(
    target: &dyn CatalogClient,
    cities: &CityDatasetMap,
    options: ReplayOptions,
    log: &dyn MigrationLog,
) -> MaterializeReport {
    log.info("Starting group and dataset creation");
    let mut outcomes = Vec::with_capacity(cities.len());
    for (city, datasets) in cities.iter() {
        let slug = GroupSlug::from_city(city);
        log.info(&format!("Processing city: {city} (group: {slug})"));

        let resolution = resolve_group(target, city, &slug, options, log);
        let datasets = if matches!(resolution, GroupResolution::Failed { .. }) {
            Vec::new()
        } else {
            datasets
                .iter()
                .map(|dataset| attach_dataset(target, &slug, dataset, options, log))
                .collect()
        };

        outcomes.push(CityOutcome {
            city: city.to_string(),
            group: slug.as_str().to_string(),
            resolution,
            datasets,
        });
    }
    log.info("Completed group and dataset creation");
    MaterializeReport {
        cities: outcomes,
        finished_at: iso_timestamp(),
    }
}

fn resolve_group(
    target: &dyn CatalogClient,
    city: &str,
    slug: &GroupSlug,
    options: ReplayOptions,
    log: &dyn MigrationLog,
) -> GroupResolution {
    match target.find_group(slug) {
        Ok(_) => {
            log.info(&format!("Group '{slug}' already exists"));
            return GroupResolution::Existing;
        }
        Err(err) if err.is_not_found() => {}
        Err(err) => {
            log.error(&format!("Failed to look up group '{slug}': {err}"));
            return GroupResolution::Failed {
                reason: err.to_string(),
            };
        }
    }

    if options.dry_run {
        log.info(&format!("Would create group '{slug}'"));
        return GroupResolution::Planned;
    }

    log.info(&format!("Creating group '{slug}'"));
    match target.create_group(&NewGroup::for_city(city)) {
        Ok(_) => {
            log.info(&format!("Created group '{slug}'"));
            GroupResolution::Created
        }
        Err(err) if err.is_duplicate() => {
            log.info(&format!(
                "Group '{slug}' already exists (caught during creation), continuing"
            ));
            GroupResolution::AlreadyExisted
        }
        Err(err) => {
            log.error(&format!("Failed to create group '{slug}': {err}"));
            GroupResolution::Failed {
                reason: err.to_string(),
            }
        }
    }
}

fn attach_dataset(
    target: &dyn CatalogClient,
    slug: &GroupSlug,
    dataset: &str,
    options: ReplayOptions,
    log: &dyn MigrationLog,
) -> AttachOutcome {
    let status = match target.show_dataset(dataset) {
        Err(err) if err.is_not_found() => {
            log.warn(&format!("Dataset '{dataset}' not found, skipping"));
            AttachStatus::NotFound
        }
        Err(err) => {
            log.error(&format!("Failed to look up dataset '{dataset}': {err}"));
            AttachStatus::Failed {
                reason: err.to_string(),
            }
        }
        Ok(_) if options.dry_run => {
            log.info(&format!("Would attach dataset '{dataset}' to '{slug}'"));
            AttachStatus::Planned
        }
        Ok(found) => {
            log.info(&format!("Attaching dataset: {dataset}"));
            match target.create_membership(slug, &found.id, Capacity::Public) {
                Ok(()) => AttachStatus::Attached,
                Err(err @ MigrateError::Validation { .. }) => {
                    log.info(&format!("Skipping '{dataset}' ({err})"));
                    AttachStatus::Rejected {
                        reason: err.to_string(),
                    }
                }
                Err(err) if err.is_not_found() => {
                    log.warn(&format!("Dataset '{dataset}' not found, skipping"));
                    AttachStatus::NotFound
                }
                Err(err) => {
                    log.error(&format!(
                        "Failed to attach '{dataset}' to '{slug}' ({}): {err}",
                        err.category()
                    ));
                    AttachStatus::Failed {
                        reason: err.to_string(),
                    }
                }
            }
        }
    };
    AttachOutcome {
        dataset: dataset.to_string(),
        status,
    }
}

/// Replaces each dataset's tag list with the mapped names.
pub fn patch_tags(
    target: &dyn CatalogClient,
    tags: &DatasetTagMap,
    options: ReplayOptions,
    log: &dyn MigrationLog,
) -> BatchReport {
    log.info("Starting dataset tag patch");
    let items = tags
        .iter()
        .map(|(dataset, names)| {
            let status = if options.dry_run {
                log.info(&format!("Would set tags of '{dataset}' to {names:?}"));
                ItemStatus::Planned
            } else {
                match target.patch_dataset_tags(dataset, names) {
                    Ok(()) => {
                        log.info(&format!("Updated tags for '{dataset}': {names:?}"));
                        ItemStatus::Done
                    }
                    Err(err) => {
                        log.error(&format!("Failed to update tags for '{dataset}': {err}"));
                        ItemStatus::Failed {
                            reason: err.to_string(),
                        }
                    }
                }
            };
            ItemOutcome {
                name: dataset.to_string(),
                status,
            }
        })
        .collect();
    BatchReport::new(items)
}

pub fn delete_tags(
    client: &dyn CatalogClient,
    tags: &[String],
    options: ReplayOptions,
    log: &dyn MigrationLog,
) -> BatchReport {
    let items = tags
        .iter()
        .map(|tag| {
            let status = if options.dry_run {
                log.info(&format!("Would delete tag '{tag}'"));
                ItemStatus::Planned
            } else {
                match client.delete_tag(tag) {
                    Ok(()) => {
                        log.info(&format!("Deleted tag '{tag}'"));
                        ItemStatus::Done
                    }
                    Err(err) => {
                        log.error(&format!("Failed to delete tag '{tag}': {err}"));
                        ItemStatus::Failed {
                            reason: err.to_string(),
                        }
                    }
                }
            };
            ItemOutcome {
                name: tag.clone(),
                status,
            }
        })
        .collect();
    BatchReport::new(items)
}

/// File-backed steps: each reads its input artifact and writes its output.
pub struct App<'a> {
    paths: ArtifactPaths,
    options: ReplayOptions,
    log: &'a dyn MigrationLog,
}

impl<'a> App<'a> {
    pub fn new(paths: ArtifactPaths, options: ReplayOptions, log: &'a dyn MigrationLog) -> Self {
        Self {
            paths,
            options,
            log,
        }
    }

    pub fn city_datasets(
        &self,
        source: &dyn CatalogClient,
    ) -> Result<CityDatasetsReport, MigrateError> {
        let roster = match roster::read_roster(self.paths.roster.as_std_path()) {
            Ok(roster) => roster,
            Err(err) => {
                self.log.error(&err.to_string());
                Vec::new()
            }
        };
        let skipped_rows = roster
            .iter()
            .filter(|record| record.city.trim().is_empty())
            .count();

        let map = build_city_datasets(source, &roster, self.log);
        self.write(&self.paths.city_datasets, &map)?;
        self.log.info(&format!(
            "Saved dataset mapping to {}",
            self.paths.city_datasets
        ));

        Ok(CityDatasetsReport {
            cities: map.len(),
            datasets: map.iter().map(|(_, datasets)| datasets.len()).sum(),
            skipped_rows,
            output: self.paths.city_datasets.to_string(),
            finished_at: iso_timestamp(),
        })
    }

    pub fn export_groups(
        &self,
        source: &dyn CatalogClient,
    ) -> Result<GroupExportReport, MigrateError> {
        let (entries, failures) = export_groups(source, self.log).inspect_err(|err| {
            self.log
                .error(&format!("Failed to list groups on source catalog: {err}"))
        })?;
        self.write(&self.paths.group_export, &entries)?;
        self.log.info(&format!(
            "Export completed, saved to '{}'",
            self.paths.group_export
        ));

        Ok(GroupExportReport {
            groups_listed: entries.len() + failures.len(),
            groups_exported: entries.len(),
            failures,
            output: self.paths.group_export.to_string(),
            finished_at: iso_timestamp(),
        })
    }

    pub fn tag_map(&self) -> Result<TagMapReport, MigrateError> {
        let entries: Vec<GroupExportEntry> = self.read(&self.paths.group_export)?;
        let map = build_dataset_tags(&entries);
        self.write(&self.paths.dataset_tags, &map)?;
        self.log.info(&format!(
            "Saved dataset tag mapping to {}",
            self.paths.dataset_tags
        ));

        Ok(TagMapReport {
            datasets: map.len(),
            assignments: map.iter().map(|(_, tags)| tags.len()).sum(),
            output: self.paths.dataset_tags.to_string(),
            finished_at: iso_timestamp(),
        })
    }

    pub fn materialize(
        &self,
        target: &dyn CatalogClient,
    ) -> Result<MaterializeReport, MigrateError> {
        let cities: CityDatasetMap = self.read(&self.paths.city_datasets)?;
        Ok(materialize_groups(target, &cities, self.options, self.log))
    }

    pub fn patch_tags(&self, target: &dyn CatalogClient) -> Result<BatchReport, MigrateError> {
        let tags: DatasetTagMap = self.read(&self.paths.dataset_tags)?;
        Ok(patch_tags(target, &tags, self.options, self.log))
    }

    pub fn list_tags(&self, client: &dyn CatalogClient) -> Result<TagListReport, MigrateError> {
        let tags = TagList {
            result: client.list_tags()?,
        };
        self.write(&self.paths.tag_list, &tags)?;
        self.log.info(&format!(
            "Saved {} tags to {}",
            tags.result.len(),
            self.paths.tag_list
        ));
        Ok(TagListReport {
            tags: tags.result.len(),
            output: self.paths.tag_list.to_string(),
            finished_at: iso_timestamp(),
        })
    }

    pub fn delete_tags(&self, client: &dyn CatalogClient) -> Result<BatchReport, MigrateError> {
        let tags: TagList = self.read(&self.paths.tag_list)?;
        Ok(delete_tags(client, &tags.result, self.options, self.log))
    }

    /// Runs both chains in order. A failing step is recorded and only the
    /// steps that depend on its output are skipped.
    pub fn run(&self, source: &dyn CatalogClient, target: &dyn CatalogClient) -> RunReport {
        let mut report = RunReport::default();

        match self.city_datasets(source) {
            Ok(step) => {
                report.city_datasets = Some(step);
                match self.materialize(target) {
                    Ok(step) => report.materialize = Some(step),
                    Err(err) => self.record(&mut report, "materialize", err),
                }
            }
            Err(err) => self.record(&mut report, "city datasets", err),
        }

        let exported = match self.export_groups(source) {
            Ok(step) => {
                report.group_export = Some(step);
                true
            }
            Err(err) => {
                self.record(&mut report, "group export", err);
                false
            }
        };
        if exported {
            match self.tag_map() {
                Ok(step) => {
                    report.tag_map = Some(step);
                    match self.patch_tags(target) {
                        Ok(step) => report.tag_patch = Some(step),
                        Err(err) => self.record(&mut report, "tag patch", err),
                    }
                }
                Err(err) => self.record(&mut report, "tag map", err),
            }
        }

        report
    }

    fn record(&self, report: &mut RunReport, step: &str, err: MigrateError) {
        let message = format!("{step} step failed: {err}");
        self.log.error(&message);
        report.errors.push(message);
    }

    fn write<T: Serialize>(&self, path: &Utf8Path, value: &T) -> Result<(), MigrateError> {
        artifacts::write_json(path, value).inspect_err(|err| {
            self.log
                .error(&format!("Error writing JSON file '{path}': {err}"))
        })
    }

    fn read<T: serde::de::DeserializeOwned>(&self, path: &Utf8Path) -> Result<T, MigrateError> {
        artifacts::read_json(path).inspect_err(|err| {
            self.log
                .error(&format!("Error reading JSON file '{path}': {err}"))
        })
    }
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
