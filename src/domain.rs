use std::collections::HashMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One row of the city roster.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CityRecord {
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub label: String,
}

/// Lowercases and turns spaces into hyphens. Applying it twice is a no-op.
pub fn slugify(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

/// Group identifier on the target catalog, derived from a city name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupSlug(String);

impl GroupSlug {
    pub fn from_city(city: &str) -> Self {
        Self(slugify(city))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Insertion-ordered map from a unique name to a list of names.
///
/// Serializes as a plain JSON object in insertion order. When a document
/// repeats a key the last value wins and the first position is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListMap {
    entries: Vec<(String, Vec<String>)>,
    index: HashMap<String, usize>,
}

impl ListMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, values: Vec<String>) {
        match self.index.get(&key) {
            Some(&position) => self.entries[position].1 = values,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, values));
            }
        }
    }

    pub fn push(&mut self, key: &str, value: String) {
        match self.index.get(key) {
            Some(&position) => self.entries[position].1.push(value),
            None => {
                self.index.insert(key.to_string(), self.entries.len());
                self.entries.push((key.to_string(), vec![value]));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.index
            .get(key)
            .map(|&position| self.entries[position].1.as_slice())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }
}

impl Serialize for ListMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, values) in &self.entries {
            map.serialize_entry(key, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ListMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ListMapVisitor;

        impl<'de> Visitor<'de> for ListMapVisitor {
            type Value = ListMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping names to lists of strings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ListMap, A::Error> {
                let mut map = ListMap::new();
                while let Some((key, values)) = access.next_entry::<String, Vec<String>>()? {
                    map.insert(key, values);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(ListMapVisitor)
    }
}

impl FromIterator<(String, Vec<String>)> for ListMap {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        let mut map = ListMap::new();
        for (key, values) in iter {
            map.insert(key, values);
        }
        map
    }
}

/// City name to the dataset names found for it on the source catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CityDatasetMap(ListMap);

impl CityDatasetMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, city: String, datasets: Vec<String>) {
        self.0.insert(city, datasets);
    }

    pub fn datasets(&self, city: &str) -> Option<&[String]> {
        self.0.get(city)
    }

    pub fn contains_city(&self, city: &str) -> bool {
        self.0.contains_key(city)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter()
    }
}

impl FromIterator<(String, Vec<String>)> for CityDatasetMap {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One source group and the names of its member datasets.
///
/// The tag mapping step reads the same file shape with the field named
/// `tag_name`, so both spellings are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupExportEntry {
    #[serde(alias = "tag_name")]
    pub group_name: String,
    #[serde(default)]
    pub datasets: Vec<String>,
}

/// Dataset name to tag names. Lists keep duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetTagMap(ListMap);

impl DatasetTagMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_tag(&mut self, dataset: &str, tag: String) {
        self.0.push(dataset, tag);
    }

    pub fn tags(&self, dataset: &str) -> Option<&[String]> {
        self.0.get(dataset)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter()
    }
}

impl FromIterator<(String, Vec<String>)> for DatasetTagMap {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The `{"result": [...]}` tag file consumed by tag deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagList {
    #[serde(default)]
    pub result: Vec<String>,
}
