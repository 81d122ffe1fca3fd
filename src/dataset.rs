use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::model::{Person, Sector};
use crate::Result;

const PEOPLE_JSON: &str = include_str!("../data/poblacion.json");
const SECTORS_JSON: &str = include_str!("../data/sectores.json");

/// The fixed dataset the bulk loader seeds every backend with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    /// people, unique by `dni`
    pub people: Vec<Person>,
    /// sectors
    pub sectors: Vec<Sector>,
}

impl Dataset {
    /// the dataset compiled into the binary
    pub fn builtin() -> Result<Dataset> {
        Ok(Dataset {
            people: serde_json::from_str(PEOPLE_JSON)?,
            sectors: serde_json::from_str(SECTORS_JSON)?,
        })
    }

    /// reads `poblacion.json` and `sectores.json` from `dir`
    pub fn from_dir(dir: &Path) -> Result<Dataset> {
        let people = fs::read_to_string(dir.join("poblacion.json"))?;
        let sectors = fs::read_to_string(dir.join("sectores.json"))?;
        Ok(Dataset {
            people: serde_json::from_str(&people)?,
            sectors: serde_json::from_str(&sectors)?,
        })
    }

    /// people de-duplicated by national id, the last occurrence winning, ordered by id
    pub fn unique_people(&self) -> Vec<Person> {
        self.people
            .iter()
            .map(|p| (p.national_id.clone(), p.clone()))
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sex;

    #[test]
    fn builtin_dataset_parses() {
        let ds = Dataset::builtin().unwrap();
        assert_eq!(ds.people.len(), 19);
        assert_eq!(ds.unique_people().len(), 19);
        assert_eq!(ds.sectors.len(), 4);
        assert_eq!(ds.sectors[2].name, "Servicios");
    }

    #[test]
    fn duplicates_collapse_to_last() {
        let ds = Dataset {
            people: vec![
                Person::new("1", "first", 10, 1, Sex::Male),
                Person::new("2", "other", 20, 1, Sex::Male),
                Person::new("1", "second", 30, 2, Sex::Female),
            ],
            sectors: vec![],
        };
        let unique = ds.unique_people();
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].name, "second");
    }
}
