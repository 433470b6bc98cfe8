use std::io::Read;
use std::path::Path;

use csv::{ReaderBuilder, Trim};

use crate::domain::CityRecord;
use crate::error::MigrateError;

pub const DEFAULT_ROSTER_FILE: &str = "city_list.csv";

/// Reads the roster at `path` in file order. Rows with a blank city are
/// kept here; the dataset builder is the one that skips them.
pub fn read_roster(path: &Path) -> Result<Vec<CityRecord>, MigrateError> {
    let file = std::fs::File::open(path)
        .map_err(|err| MigrateError::Roster(format!("open {}: {err}", path.display())))?;
    read_roster_from(file)
}

pub fn read_roster_from<R: Read>(reader: R) -> Result<Vec<CityRecord>, MigrateError> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|err| MigrateError::Roster(err.to_string()))?;
    for column in ["city", "label"] {
        if !headers.iter().any(|header| header == column) {
            return Err(MigrateError::Roster(format!(
                "header row has no `{column}` column"
            )));
        }
    }

    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let record: CityRecord = result.map_err(|err| MigrateError::Roster(err.to_string()))?;
        records.push(record);
    }
    Ok(records)
}
