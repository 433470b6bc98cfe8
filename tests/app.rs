use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use camino::Utf8PathBuf;
use serde_json::json;
use tracing::Level;

use ckan_migrator::app::{
    App, ArtifactPaths, AttachStatus, GroupResolution, ItemStatus, ReplayOptions,
    build_city_datasets, build_dataset_tags, delete_tags, export_groups, materialize_groups,
    patch_tags,
};
use ckan_migrator::catalog::{
    Capacity, CatalogClient, DatasetRef, GroupDetail, GroupSummary, NamedRef, NewGroup, SearchPage,
    datasets_for_city,
};
use ckan_migrator::domain::{CityDatasetMap, CityRecord, DatasetTagMap, GroupExportEntry, GroupSlug};
use ckan_migrator::error::MigrateError;
use ckan_migrator::log::RecordingLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Network,
    NotFound,
    Duplicate,
    Invalid,
    Malformed,
}

impl Failure {
    fn error(self) -> MigrateError {
        match self {
            Failure::Network => MigrateError::CatalogHttp("connection reset".to_string()),
            Failure::NotFound => MigrateError::from_api_error(&json!({
                "__type": "Not Found Error",
                "message": "Not found"
            })),
            Failure::Duplicate => MigrateError::from_api_error(&json!({
                "__type": "Validation Error",
                "name": ["Group name already exists in database"]
            })),
            Failure::Invalid => MigrateError::from_api_error(&json!({
                "__type": "Validation Error",
                "name": ["Must be purely lowercase alphanumeric (ascii) characters"]
            })),
            Failure::Malformed => MigrateError::MalformedResponse("missing field `name`".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Search(String),
    ShowGroup(String),
    FindGroup(String),
    CreateGroup(NewGroup),
    ShowDataset(String),
    Member {
        group: String,
        dataset_id: String,
        capacity: Capacity,
    },
    Patch(String, Vec<String>),
    DeleteTag(String),
}

#[derive(Default)]
struct FakeCatalog {
    search_results: HashMap<String, Vec<String>>,
    search_failures: HashMap<String, Failure>,
    search_counts: HashMap<String, usize>,
    groups: Vec<String>,
    group_members: HashMap<String, Vec<String>>,
    group_failures: HashMap<String, Failure>,
    list_failure: Option<Failure>,
    existing_groups: Mutex<HashSet<String>>,
    create_failure: Option<Failure>,
    datasets: HashMap<String, String>,
    member_failures: HashMap<String, Failure>,
    patch_failures: HashMap<String, Failure>,
    tags: Vec<String>,
    delete_failures: HashMap<String, Failure>,
    calls: Mutex<Vec<Call>>,
}

impl FakeCatalog {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn with_datasets(mut self, pairs: &[(&str, &str)]) -> Self {
        for (name, id) in pairs {
            self.datasets.insert(name.to_string(), id.to_string());
        }
        self
    }

    fn with_existing_group(self, slug: &str) -> Self {
        self.existing_groups.lock().unwrap().insert(slug.to_string());
        self
    }
}

impl CatalogClient for FakeCatalog {
    fn search_datasets(&self, city: &str) -> Result<SearchPage, MigrateError> {
        self.record(Call::Search(city.to_string()));
        if let Some(failure) = self.search_failures.get(city) {
            return Err(failure.error());
        }
        let results = self
            .search_results
            .get(city)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|name| NamedRef { name })
            .collect::<Vec<_>>();
        Ok(SearchPage {
            count: self
                .search_counts
                .get(city)
                .copied()
                .unwrap_or(results.len()),
            results,
        })
    }

    fn list_groups(&self) -> Result<Vec<GroupSummary>, MigrateError> {
        if let Some(failure) = self.list_failure {
            return Err(failure.error());
        }
        Ok(self
            .groups
            .iter()
            .map(|name| GroupSummary {
                name: name.clone(),
                id: None,
                title: None,
            })
            .collect())
    }

    fn show_group(&self, name: &str) -> Result<GroupDetail, MigrateError> {
        self.record(Call::ShowGroup(name.to_string()));
        if let Some(failure) = self.group_failures.get(name) {
            return Err(failure.error());
        }
        let packages = self
            .group_members
            .get(name)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|name| NamedRef { name })
            .collect();
        Ok(GroupDetail {
            name: name.to_string(),
            packages,
        })
    }

    fn find_group(&self, slug: &GroupSlug) -> Result<GroupSummary, MigrateError> {
        self.record(Call::FindGroup(slug.as_str().to_string()));
        if self.existing_groups.lock().unwrap().contains(slug.as_str()) {
            Ok(GroupSummary {
                name: slug.as_str().to_string(),
                id: None,
                title: None,
            })
        } else {
            Err(Failure::NotFound.error())
        }
    }

    fn create_group(&self, group: &NewGroup) -> Result<GroupSummary, MigrateError> {
        self.record(Call::CreateGroup(group.clone()));
        if let Some(failure) = self.create_failure {
            return Err(failure.error());
        }
        self.existing_groups
            .lock()
            .unwrap()
            .insert(group.name.clone());
        Ok(GroupSummary {
            name: group.name.clone(),
            id: Some(format!("id-{}", group.name)),
            title: Some(group.title.clone()),
        })
    }

    fn show_dataset(&self, name: &str) -> Result<DatasetRef, MigrateError> {
        self.record(Call::ShowDataset(name.to_string()));
        match self.datasets.get(name) {
            Some(id) => Ok(DatasetRef {
                id: id.clone(),
                name: name.to_string(),
            }),
            None => Err(Failure::NotFound.error()),
        }
    }

    fn create_membership(
        &self,
        group: &GroupSlug,
        dataset_id: &str,
        capacity: Capacity,
    ) -> Result<(), MigrateError> {
        self.record(Call::Member {
            group: group.as_str().to_string(),
            dataset_id: dataset_id.to_string(),
            capacity,
        });
        match self.member_failures.get(dataset_id) {
            Some(failure) => Err(failure.error()),
            None => Ok(()),
        }
    }

    fn patch_dataset_tags(&self, dataset: &str, tags: &[String]) -> Result<(), MigrateError> {
        self.record(Call::Patch(dataset.to_string(), tags.to_vec()));
        match self.patch_failures.get(dataset) {
            Some(failure) => Err(failure.error()),
            None => Ok(()),
        }
    }

    fn list_tags(&self) -> Result<Vec<String>, MigrateError> {
        Ok(self.tags.clone())
    }

    fn delete_tag(&self, tag: &str) -> Result<(), MigrateError> {
        self.record(Call::DeleteTag(tag.to_string()));
        match self.delete_failures.get(tag) {
            Some(failure) => Err(failure.error()),
            None => Ok(()),
        }
    }
}

fn record(city: &str, label: &str) -> CityRecord {
    CityRecord {
        city: city.to_string(),
        label: label.to_string(),
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn city_map(entries: &[(&str, &[&str])]) -> CityDatasetMap {
    entries
        .iter()
        .map(|(city, datasets)| (city.to_string(), strings(datasets)))
        .collect()
}

fn export(entries: &[(&str, &[&str])]) -> Vec<GroupExportEntry> {
    entries
        .iter()
        .map(|(group, datasets)| GroupExportEntry {
            group_name: group.to_string(),
            datasets: strings(datasets),
        })
        .collect()
}

#[test]
fn city_builder_skips_blank_rows_and_keeps_empty_results() {
    let mut source = FakeCatalog::default();
    source
        .search_results
        .insert("Alpha City".to_string(), strings(&["ds-1", "ds-2"]));
    let log = RecordingLog::new();

    let roster = vec![record("Alpha City", "A"), record("  ", "blank"), record("Beta", "B")];
    let map = build_city_datasets(&source, &roster, &log);

    assert_eq!(map.len(), 2);
    assert_eq!(map.datasets("Alpha City").unwrap(), ["ds-1", "ds-2"]);
    assert_eq!(map.datasets("Beta"), Some(&[][..]));
    assert!(!map.contains_city(""));
    assert!(!map.contains_city("  "));
    assert_eq!(
        source.calls(),
        vec![
            Call::Search("Alpha City".to_string()),
            Call::Search("Beta".to_string())
        ]
    );
}

#[test]
fn failed_search_becomes_empty_list_with_warning() {
    let mut source = FakeCatalog::default();
    source
        .search_failures
        .insert("Gamma".to_string(), Failure::Network);
    source
        .search_results
        .insert("Delta".to_string(), strings(&["ds-9"]));
    let log = RecordingLog::new();

    let map = build_city_datasets(&source, &[record("Gamma", "G"), record("Delta", "D")], &log);

    assert_eq!(map.datasets("Gamma"), Some(&[][..]));
    assert_eq!(map.datasets("Delta").unwrap(), ["ds-9"]);
    let warnings = log.messages_at(Level::WARN);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("Gamma"));
}

#[test]
fn truncated_search_warns_once_and_keeps_fetched_names() {
    let mut source = FakeCatalog::default();
    source
        .search_results
        .insert("Omega".to_string(), strings(&["ds-1", "ds-2"]));
    source.search_counts.insert("Omega".to_string(), 1500);
    let log = RecordingLog::new();

    let datasets = datasets_for_city(&source, "Omega", &log);

    assert_eq!(datasets, strings(&["ds-1", "ds-2"]));
    let warnings = log.messages_at(Level::WARN);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("Omega"));
    assert!(warnings[0].contains("1500"));
    assert!(warnings[0].contains("only 2"));
}

#[test]
fn export_skips_failing_groups_and_keeps_order() {
    let mut source = FakeCatalog {
        groups: strings(&["theme-a", "theme-b", "theme-c", "theme-d"]),
        ..Default::default()
    };
    source
        .group_members
        .insert("theme-a".to_string(), strings(&["ds-1", "ds-2"]));
    source
        .group_members
        .insert("theme-d".to_string(), strings(&["ds-2"]));
    source
        .group_failures
        .insert("theme-b".to_string(), Failure::NotFound);
    source
        .group_failures
        .insert("theme-c".to_string(), Failure::Malformed);
    let log = RecordingLog::new();

    let (entries, failures) = export_groups(&source, &log).unwrap();

    assert_eq!(entries, export(&[("theme-a", &["ds-1", "ds-2"]), ("theme-d", &["ds-2"])]));
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].category, "not found");
    assert_eq!(failures[1].category, "malformed response");
    assert_eq!(log.messages_at(Level::WARN).len(), 1);
    assert_eq!(log.messages_at(Level::ERROR).len(), 1);
}

#[test]
fn export_fails_only_when_group_list_fails() {
    let source = FakeCatalog {
        list_failure: Some(Failure::Network),
        ..Default::default()
    };
    let err = export_groups(&source, &RecordingLog::new()).unwrap_err();
    assert!(err.is_catalog());
}

#[test]
fn tag_map_inverts_export() {
    let map = build_dataset_tags(&export(&[("theme-x", &["ds-1", "ds-3"])]));
    assert_eq!(map.tags("ds-1").unwrap(), ["theme-x"]);
    assert_eq!(map.tags("ds-3").unwrap(), ["theme-x"]);
    assert_eq!(map.len(), 2);
}

#[test]
fn tag_map_keeps_duplicates_and_group_order() {
    let map = build_dataset_tags(&export(&[
        ("theme-b", &["ds-1"]),
        ("theme-a", &["ds-2", "ds-1"]),
        ("theme-b", &["ds-1"]),
    ]));
    assert_eq!(map.tags("ds-1").unwrap(), ["theme-b", "theme-a", "theme-b"]);
    assert_eq!(map.tags("ds-2").unwrap(), ["theme-a"]);
    let order = map.iter().map(|(dataset, _)| dataset).collect::<Vec<_>>();
    assert_eq!(order, vec!["ds-1", "ds-2"]);
}

#[test]
fn materialize_creates_group_and_attaches_datasets() {
    let target = FakeCatalog::default().with_datasets(&[("ds-1", "uuid-1"), ("ds-2", "uuid-2")]);
    let log = RecordingLog::new();

    let report = materialize_groups(
        &target,
        &city_map(&[("Alpha City", &["ds-1", "ds-2"])]),
        ReplayOptions::default(),
        &log,
    );

    assert_eq!(report.cities[0].group, "alpha-city");
    assert_eq!(report.cities[0].resolution, GroupResolution::Created);
    assert_eq!(report.attached(), 2);
    assert_eq!(
        target.calls(),
        vec![
            Call::FindGroup("alpha-city".to_string()),
            Call::CreateGroup(NewGroup {
                name: "alpha-city".to_string(),
                title: "Alpha City".to_string(),
                description: "Datasets related to Alpha City".to_string(),
            }),
            Call::ShowDataset("ds-1".to_string()),
            Call::Member {
                group: "alpha-city".to_string(),
                dataset_id: "uuid-1".to_string(),
                capacity: Capacity::Public,
            },
            Call::ShowDataset("ds-2".to_string()),
            Call::Member {
                group: "alpha-city".to_string(),
                dataset_id: "uuid-2".to_string(),
                capacity: Capacity::Public,
            },
        ]
    );
}

#[test]
fn materialize_existing_group_skips_create() {
    let target = FakeCatalog::default()
        .with_existing_group("beta")
        .with_datasets(&[("ds-1", "uuid-1")]);
    let log = RecordingLog::new();

    let report = materialize_groups(
        &target,
        &city_map(&[("Beta", &["ds-1", "ds-missing"])]),
        ReplayOptions::default(),
        &log,
    );

    let calls = target.calls();
    assert!(!calls.iter().any(|call| matches!(call, Call::CreateGroup(_))));
    assert_eq!(report.cities[0].resolution, GroupResolution::Existing);
    assert_eq!(report.cities[0].datasets.len(), 2);
    assert_eq!(report.cities[0].datasets[1].status, AttachStatus::NotFound);
    assert!(calls.contains(&Call::ShowDataset("ds-missing".to_string())));
}

#[test]
fn duplicate_name_on_create_counts_as_resolved() {
    let target = FakeCatalog {
        create_failure: Some(Failure::Duplicate),
        ..Default::default()
    }
    .with_datasets(&[("ds-1", "uuid-1")]);

    let report = materialize_groups(
        &target,
        &city_map(&[("Gamma", &["ds-1"])]),
        ReplayOptions::default(),
        &RecordingLog::new(),
    );

    assert_eq!(report.cities[0].resolution, GroupResolution::AlreadyExisted);
    assert_eq!(report.attached(), 1);
}

#[test]
fn failed_create_abandons_city_but_not_the_next() {
    let target = FakeCatalog {
        create_failure: Some(Failure::Invalid),
        ..Default::default()
    }
    .with_existing_group("delta")
    .with_datasets(&[("ds-1", "uuid-1"), ("ds-2", "uuid-2")]);
    let log = RecordingLog::new();

    let report = materialize_groups(
        &target,
        &city_map(&[("Bad City", &["ds-1"]), ("Delta", &["ds-2"])]),
        ReplayOptions::default(),
        &log,
    );

    assert!(matches!(
        report.cities[0].resolution,
        GroupResolution::Failed { .. }
    ));
    assert!(report.cities[0].datasets.is_empty());
    let members = target
        .calls()
        .into_iter()
        .filter(|call| matches!(call, Call::Member { .. }))
        .collect::<Vec<_>>();
    assert_eq!(
        members,
        vec![Call::Member {
            group: "delta".to_string(),
            dataset_id: "uuid-2".to_string(),
            capacity: Capacity::Public,
        }]
    );
    assert!(!target.calls().contains(&Call::ShowDataset("ds-1".to_string())));
    assert_eq!(log.messages_at(Level::ERROR).len(), 1);
}

#[test]
fn membership_validation_is_soft_and_other_errors_continue() {
    let mut target = FakeCatalog::default()
        .with_existing_group("epsilon")
        .with_datasets(&[("ds-1", "uuid-1"), ("ds-2", "uuid-2"), ("ds-3", "uuid-3")]);
    target
        .member_failures
        .insert("uuid-1".to_string(), Failure::Duplicate);
    target
        .member_failures
        .insert("uuid-2".to_string(), Failure::Network);
    let log = RecordingLog::new();

    let report = materialize_groups(
        &target,
        &city_map(&[("Epsilon", &["ds-1", "ds-2", "ds-3"])]),
        ReplayOptions::default(),
        &log,
    );

    let statuses = report.cities[0]
        .datasets
        .iter()
        .map(|outcome| outcome.status.clone())
        .collect::<Vec<_>>();
    assert!(matches!(statuses[0], AttachStatus::Rejected { .. }));
    assert!(matches!(statuses[1], AttachStatus::Failed { .. }));
    assert_eq!(statuses[2], AttachStatus::Attached);
    assert_eq!(log.messages_at(Level::ERROR).len(), 1);
    assert!(
        log.messages_at(Level::INFO)
            .iter()
            .any(|message| message.starts_with("Skipping 'ds-1'"))
    );
}

#[test]
fn dry_run_materialize_issues_no_mutations() {
    let target = FakeCatalog::default().with_datasets(&[("ds-1", "uuid-1")]);

    let report = materialize_groups(
        &target,
        &city_map(&[("Zeta", &["ds-1"])]),
        ReplayOptions { dry_run: true },
        &RecordingLog::new(),
    );

    assert_eq!(report.cities[0].resolution, GroupResolution::Planned);
    assert_eq!(report.cities[0].datasets[0].status, AttachStatus::Planned);
    assert!(
        target
            .calls()
            .iter()
            .all(|call| matches!(call, Call::FindGroup(_) | Call::ShowDataset(_)))
    );
}

#[test]
fn patch_replaces_tags_and_continues_after_failure() {
    let mut target = FakeCatalog::default();
    target
        .patch_failures
        .insert("ds-1".to_string(), Failure::NotFound);
    let tags: DatasetTagMap = vec![
        ("ds-1".to_string(), strings(&["a"])),
        ("ds-2".to_string(), strings(&["b", "b"])),
    ]
    .into_iter()
    .collect();

    let report = patch_tags(&target, &tags, ReplayOptions::default(), &RecordingLog::new());

    assert_eq!(report.failed(), 1);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(
        target.calls(),
        vec![
            Call::Patch("ds-1".to_string(), strings(&["a"])),
            Call::Patch("ds-2".to_string(), strings(&["b", "b"])),
        ]
    );
}

#[test]
fn export_then_patch_assigns_every_group_name() {
    let mut source = FakeCatalog {
        groups: strings(&["theme-x", "theme-y"]),
        ..Default::default()
    };
    source
        .group_members
        .insert("theme-x".to_string(), strings(&["ds-1", "ds-3"]));
    source
        .group_members
        .insert("theme-y".to_string(), strings(&["ds-1"]));
    let target = FakeCatalog::default();
    let log = RecordingLog::new();

    let (entries, _) = export_groups(&source, &log).unwrap();
    let tags = build_dataset_tags(&entries);
    patch_tags(&target, &tags, ReplayOptions::default(), &log);

    assert_eq!(
        target.calls(),
        vec![
            Call::Patch("ds-1".to_string(), strings(&["theme-x", "theme-y"])),
            Call::Patch("ds-3".to_string(), strings(&["theme-x"])),
        ]
    );
}

#[test]
fn delete_tags_reports_each_tag() {
    let mut client = FakeCatalog::default();
    client
        .delete_failures
        .insert("keep".to_string(), Failure::NotFound);

    let report = delete_tags(
        &client,
        &strings(&["old", "keep", "stale"]),
        ReplayOptions::default(),
        &RecordingLog::new(),
    );

    assert_eq!(report.items.len(), 3);
    assert_eq!(report.items[0].status, ItemStatus::Done);
    assert!(matches!(report.items[1].status, ItemStatus::Failed { .. }));
    assert_eq!(report.items[2].status, ItemStatus::Done);
    assert_eq!(client.calls().len(), 3);
}

fn temp_paths(dir: &tempfile::TempDir) -> ArtifactPaths {
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    ArtifactPaths {
        roster: root.join("city_list.csv"),
        city_datasets: root.join("datasets_by_city.json"),
        group_export: root.join("group_dataset.json"),
        dataset_tags: root.join("dataset_tags.json"),
        tag_list: root.join("tags.json"),
    }
}

#[test]
fn run_writes_every_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let paths = temp_paths(&dir);
    std::fs::write(paths.roster.as_std_path(), "city,label\nAlpha City,A\n,\n").unwrap();

    let mut source = FakeCatalog {
        groups: strings(&["theme-x"]),
        ..Default::default()
    };
    source
        .search_results
        .insert("Alpha City".to_string(), strings(&["ds-1", "ds-2"]));
    source
        .group_members
        .insert("theme-x".to_string(), strings(&["ds-1", "ds-3"]));
    let target = FakeCatalog::default().with_datasets(&[("ds-1", "uuid-1"), ("ds-2", "uuid-2")]);
    let log = RecordingLog::new();

    let app = App::new(paths.clone(), ReplayOptions::default(), &log);
    let report = app.run(&source, &target);

    assert!(report.errors.is_empty());
    assert_eq!(report.city_datasets.as_ref().unwrap().skipped_rows, 1);
    assert_eq!(report.materialize.as_ref().unwrap().attached(), 2);
    assert_eq!(report.tag_patch.as_ref().unwrap().succeeded(), 2);

    let cities = std::fs::read_to_string(paths.city_datasets.as_std_path()).unwrap();
    let cities: serde_json::Value = serde_json::from_str(&cities).unwrap();
    assert_eq!(cities, json!({"Alpha City": ["ds-1", "ds-2"]}));

    let tags = std::fs::read_to_string(paths.dataset_tags.as_std_path()).unwrap();
    let tags: serde_json::Value = serde_json::from_str(&tags).unwrap();
    assert_eq!(tags, json!({"ds-1": ["theme-x"], "ds-3": ["theme-x"]}));
}

#[test]
fn missing_roster_still_writes_empty_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let paths = temp_paths(&dir);
    let log = RecordingLog::new();

    let app = App::new(paths.clone(), ReplayOptions::default(), &log);
    let report = app.city_datasets(&FakeCatalog::default()).unwrap();

    assert_eq!(report.cities, 0);
    let content = std::fs::read_to_string(paths.city_datasets.as_std_path()).unwrap();
    assert_eq!(content, "{}");
    assert_eq!(log.messages_at(Level::ERROR).len(), 1);
}

#[test]
fn list_then_delete_tags_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let paths = temp_paths(&dir);
    let client = FakeCatalog {
        tags: strings(&["old", "stale"]),
        ..Default::default()
    };
    let log = RecordingLog::new();

    let app = App::new(paths, ReplayOptions::default(), &log);
    assert_eq!(app.list_tags(&client).unwrap().tags, 2);
    let report = app.delete_tags(&client).unwrap();

    assert_eq!(report.succeeded(), 2);
    assert_eq!(
        client.calls(),
        vec![
            Call::DeleteTag("old".to_string()),
            Call::DeleteTag("stale".to_string())
        ]
    );
}
