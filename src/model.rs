//! The two domain entities shared by every backend, [`Person`] and [`Sector`], plus the
//! derived [`SectorTotal`] rows and the secondary index vocabulary used to query people.
//!
//! Field names on the wire follow the JSON documents of the bundled dataset
//! (`dni`, `nombre`, `ingresos`, ...), so data written by this crate is interchangeable with
//! data written by other tools against the same buckets.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{DbError, Result};

/// bucket / collection / key prefix holding people
pub const PEOPLE: &str = "poblacion";
/// bucket / collection / key prefix holding sectors
pub const SECTORS: &str = "sectores";
/// bucket holding derived summaries
pub const SUMMARIES: &str = "resumenes";
/// key of the income-by-sector summary inside [`SUMMARIES`]
pub const SUMMARY_KEY: &str = "resumen_sector";
/// channel a new-person event is published on
pub const NEW_PERSON_CHANNEL: &str = "nueva_persona";

/// Categorical sex as stored in the `sexo` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sex {
    /// `"H"` (hombre)
    #[serde(rename = "H")]
    Male,
    /// `"M"` (mujer)
    #[serde(rename = "M")]
    Female,
}

impl Sex {
    /// the single letter code stored in the backends
    pub fn code(self) -> &'static str {
        match self {
            Sex::Male => "H",
            Sex::Female => "M",
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Sex {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "H" | "h" => Ok(Sex::Male),
            "M" | "m" => Ok(Sex::Female),
            other => Err(DbError::Parsing(format!("'{}' as a sex, expected H or M", other))),
        }
    }
}

/// A member of the population, keyed by national id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    /// national id, the primary key
    #[serde(rename = "dni")]
    pub national_id: String,
    /// first name
    #[serde(rename = "nombre")]
    pub name: String,
    /// `apellido1`
    #[serde(rename = "apellido1", default, skip_serializing_if = "Option::is_none")]
    pub first_surname: Option<String>,
    /// `apellido2`
    #[serde(rename = "apellido2", default, skip_serializing_if = "Option::is_none")]
    pub second_surname: Option<String>,
    /// `YYYY-MM-DD`
    #[serde(rename = "fechanac", default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<String>,
    /// `direccion`
    #[serde(rename = "direccion", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// `cp`
    #[serde(rename = "cp", default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    /// `sexo`
    #[serde(rename = "sexo")]
    pub sex: Sex,
    /// yearly income
    #[serde(rename = "ingresos")]
    pub income: i64,
    /// `gastosFijos`
    #[serde(rename = "gastosFijos", default, skip_serializing_if = "Option::is_none")]
    pub fixed_expenses: Option<i64>,
    /// `gastosAlim`
    #[serde(rename = "gastosAlim", default, skip_serializing_if = "Option::is_none")]
    pub food_expenses: Option<i64>,
    /// `gastosRopa`
    #[serde(rename = "gastosRopa", default, skip_serializing_if = "Option::is_none")]
    pub clothing_expenses: Option<i64>,
    /// sector code, never checked against the sectors bucket
    pub sector: u32,
}

impl Person {
    /// builds a person carrying only the fields the insert operation accepts
    pub fn new(national_id: impl Into<String>, name: impl Into<String>, income: i64, sector: u32, sex: Sex) -> Self {
        Person {
            national_id: national_id.into(),
            name: name.into(),
            first_surname: None,
            second_surname: None,
            birth_date: None,
            address: None,
            postal_code: None,
            sex,
            income,
            fixed_expenses: None,
            food_expenses: None,
            clothing_expenses: None,
            sector,
        }
    }

    /// the secondary index values this person is written with
    pub fn index_entries(&self) -> Vec<IndexEntry> {
        vec![
            (Index::Income, IndexValue::Int(self.income)),
            (Index::Sector, IndexValue::Int(i64::from(self.sector))),
            (Index::Sex, IndexValue::Bin(self.sex.code().to_string())),
        ]
    }

    /// the event announced on [`NEW_PERSON_CHANNEL`] once this person is inserted
    pub fn joined_message(&self) -> String {
        format!("Se ha unido {}", self.name)
    }

    /// serializes into the JSON document stored by the backends
    pub fn to_record(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// parses a stored JSON document; unknown fields (such as MongoDB's `_id`) are ignored
    pub fn from_record(record: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(record)?)
    }
}

/// An economic sector. Only `code` and `name` carry meaning, the other two fields are
/// placeholders kept for document compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sector {
    /// sector code, the key
    #[serde(rename = "codS")]
    pub code: u32,
    /// sector name
    #[serde(rename = "nombreS")]
    pub name: String,
    /// unused
    #[serde(rename = "porcentS", default)]
    pub percentage: f64,
    /// unused
    #[serde(rename = "ingresosS", default)]
    pub total_income: f64,
}

/// One row of the derived income-by-sector summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorTotal {
    /// sector code
    pub sector: u32,
    /// summed income
    pub total: i64,
}

/// Sums incomes per sector, ordered by sector code.
pub fn totals_by_sector<'a>(people: impl IntoIterator<Item = &'a Person>) -> Vec<SectorTotal> {
    let mut totals = std::collections::BTreeMap::<u32, i64>::new();
    for p in people {
        let total = totals.entry(p.sector).or_default();
        *total = total.saturating_add(p.income);
    }
    totals
        .into_iter()
        .map(|(sector, total)| SectorTotal { sector, total })
        .collect()
}

/// The secondary indexes maintained on people.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Index {
    /// `ingresos_int`
    Income,
    /// `sector_int`
    Sector,
    /// `sexo_bin`
    Sex,
}

impl Index {
    /// the key-value store's index name, type suffix included
    pub fn riak_name(self) -> &'static str {
        match self {
            Index::Income => "ingresos_int",
            Index::Sector => "sector_int",
            Index::Sex => "sexo_bin",
        }
    }

    /// the document field the index is built over
    pub fn field(self) -> &'static str {
        match self {
            Index::Income => "ingresos",
            Index::Sector => "sector",
            Index::Sex => "sexo",
        }
    }
}

/// A value written to, or looked up in, a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexValue {
    /// an integer index value
    Int(i64),
    /// a binary (string) index value
    Bin(String),
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexValue::Int(i) => write!(f, "{}", i),
            IndexValue::Bin(s) => f.write_str(s),
        }
    }
}

/// an index together with the value a record holds for it
pub type IndexEntry = (Index, IndexValue);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn person_uses_document_field_names() {
        let p = Person::new("555888999", "Laura", 30000, 2, Sex::Female);
        let record = p.to_record().unwrap();
        assert_eq!(
            record,
            json!({"dni": "555888999", "nombre": "Laura", "sexo": "M", "ingresos": 30000, "sector": 2})
        );
        assert_eq!(Person::from_record(record).unwrap(), p);
    }

    #[test]
    fn from_record_ignores_mongo_id() {
        let record = json!({"_id": "1", "dni": "1", "nombre": "Ana", "sexo": "M", "ingresos": 10, "sector": 1});
        assert_eq!(Person::from_record(record).unwrap().national_id, "1");
    }

    #[test]
    fn sex_parses_codes_only() {
        assert_eq!("h".parse::<Sex>().unwrap(), Sex::Male);
        assert_eq!(" M ".parse::<Sex>().unwrap(), Sex::Female);
        assert!("X".parse::<Sex>().is_err());
    }

    #[test]
    fn index_entries_cover_all_indexes() {
        let p = Person::new("1", "Ana", 1500, 3, Sex::Male);
        assert_eq!(
            p.index_entries(),
            vec![
                (Index::Income, IndexValue::Int(1500)),
                (Index::Sector, IndexValue::Int(3)),
                (Index::Sex, IndexValue::Bin("H".into())),
            ]
        );
    }

    #[test]
    fn totals_are_grouped_and_sorted() {
        let people = vec![
            Person::new("1", "a", 2000, 2, Sex::Male),
            Person::new("2", "b", 1000, 1, Sex::Male),
            Person::new("3", "c", 2000, 1, Sex::Female),
        ];
        assert_eq!(
            totals_by_sector(&people),
            vec![SectorTotal { sector: 1, total: 3000 }, SectorTotal { sector: 2, total: 2000 }]
        );
    }
}
