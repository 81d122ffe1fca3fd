use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{ErrorKind as MongoErrorKind, WriteFailure};
use mongodb::options::{FindOptions, InsertManyOptions, ReplaceOptions};
use mongodb::sync::{Client, Collection, Database};
use mongodb::IndexModel;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::{incremented, Backend, BackendKind, Record};
use crate::command::Command;
use crate::model::{Index, IndexEntry, IndexValue, Person, SectorTotal, Sex, PEOPLE, SUMMARIES, SUMMARY_KEY};
use crate::trace::Tracer;
use crate::{DbError, Result};

const DUPLICATE_KEY: i32 = 11000;
const NAMESPACE_NOT_FOUND: i32 = 26;
// field holding each sector's total in the summary collection
const TOTAL_FIELD: &str = "totalIngresos";

/// Adapter for a MongoDB deployment through the driver's blocking API.
///
/// Every bucket is a collection of the configured database, with the record key stored as
/// `_id`. The summary bucket maps onto its own `resumen_sector` collection, one document per
/// sector. Queries, increments and the aggregation run server-side.
pub struct MongoBackend {
    db: Database,
}

impl MongoBackend {
    /// creates an adapter for database `db_name` at `uri`. The driver connects lazily, so an
    /// unreachable server only shows up on the first call.
    #[instrument]
    pub fn new(uri: &str, db_name: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)?;
        debug!("mongo client ready");
        Ok(MongoBackend {
            db: client.database(db_name),
        })
    }

    fn collection(&self, bucket: &str) -> Collection<Document> {
        let name = if bucket == SUMMARIES { SUMMARY_KEY } else { bucket };
        self.db.collection::<Document>(name)
    }

    fn people(&self) -> Collection<Document> {
        self.collection(PEOPLE)
    }

    fn keys_matching(&self, bucket: &str, filter: Document) -> Result<Vec<String>> {
        let options = FindOptions::builder()
            .projection(doc! { "_id": 1 })
            .sort(doc! { "_id": 1 })
            .build();
        let mut keys = Vec::new();
        for found in self.collection(bucket).find(filter, options)? {
            if let Some(id) = found?.get("_id") {
                keys.push(id_string(id));
            }
        }
        Ok(keys)
    }

    fn find_people(&self, filter: Document) -> Result<Vec<Person>> {
        debug!("poblacion.find({})", filter);
        let options = FindOptions::builder().sort(doc! { "_id": 1 }).build();
        let mut people = Vec::new();
        for found in self.people().find(filter, options)? {
            people.push(Person::from_record(to_json(found?))?);
        }
        Ok(people)
    }
}

/// a stored document as plain JSON, without the `_id` the adapter adds
fn to_json(mut doc: Document) -> Value {
    doc.remove("_id");
    Bson::Document(doc).into_relaxed_extjson()
}

/// a JSON record as a document keyed by `key`
fn to_doc(key: &str, record: &Value) -> Result<Document> {
    let mut doc = mongodb::bson::to_document(record)?;
    doc.insert("_id", key);
    Ok(doc)
}

fn id_string(id: &Bson) -> String {
    match id {
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_i64(value: Option<&Bson>) -> Option<i64> {
    match value? {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(f) => Some(*f as i64),
        _ => None,
    }
}

fn index_bson(value: &IndexValue) -> Bson {
    match value {
        IndexValue::Int(n) => Bson::Int64(*n),
        IndexValue::Bin(s) => Bson::String(s.clone()),
    }
}

fn is_duplicate(e: &mongodb::error::Error) -> bool {
    matches!(&*e.kind, MongoErrorKind::Write(WriteFailure::WriteError(w)) if w.code == DUPLICATE_KEY)
}

fn is_missing_namespace(e: &mongodb::error::Error) -> bool {
    matches!(&*e.kind, MongoErrorKind::Command(c) if c.code == NAMESPACE_NOT_FOUND)
}

impl Backend for MongoBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mongo
    }

    fn ping(&self) -> Result<()> {
        self.db
            .run_command(doc! { "ping": 1 }, None)
            .map(|_| ())
            .map_err(|e| DbError::Unavailable(BackendKind::Mongo, e.to_string()))
    }

    fn render(&self, cmd: &Command) -> String {
        match cmd {
            Command::List => "db.poblacion.find({})".to_string(),
            Command::Get { dni } => format!("db.poblacion.findOne({{_id: \"{}\"}})", dni),
            Command::Insert { person } => {
                let mut record = person.to_record().unwrap_or_default();
                record["_id"] = json!(person.national_id);
                format!("db.poblacion.insertOne({})", record)
            }
            Command::Update { dni, delta } => format!(
                "db.poblacion.updateOne({{_id: \"{}\"}}, {{$inc: {{ingresos: {}}}}})",
                dni, delta
            ),
            Command::Delete { dni } => format!("db.poblacion.deleteOne({{_id: \"{}\"}})", dni),
            Command::Reindex => "db.poblacion.createIndex({ingresos: 1})\n\
                 db.poblacion.createIndex({sector: 1, sexo: 1})\n\
                 db.poblacion.getIndexes()"
                .to_string(),
            Command::RangeQuery { min, max } => format!(
                "db.poblacion.find({{ingresos: {{$gte: {}, $lte: {}}}}})",
                min, max
            ),
            Command::FilterQuery { sector, sex } => {
                format!("db.poblacion.find({{sector: {}, sexo: \"{}\"}})", sector, sex)
            }
            Command::Aggregate { sector } => format!(
                "db.poblacion.aggregate([\n  {{$group: {{_id: \"$sector\", totalIngresos: {{$sum: \"$ingresos\"}}}}}},\n  {{$sort: {{_id: 1}}}}\n])\n\
                 db.{key}.deleteMany({{}})\ndb.{key}.insertMany(totals)\n// report sector {}",
                sector,
                key = SUMMARY_KEY
            ),
        }
    }

    fn list(&self, bucket: &str) -> Result<Vec<String>> {
        self.keys_matching(bucket, doc! {})
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .collection(bucket)
            .find_one(doc! { "_id": key }, None)?
            .map(to_json))
    }

    fn put(&self, bucket: &str, key: &str, record: &Value, _indexes: &[IndexEntry]) -> Result<()> {
        let doc = to_doc(key, record)?;
        let options = ReplaceOptions::builder().upsert(true).build();
        self.collection(bucket)
            .replace_one(doc! { "_id": key }, doc, options)?;
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        let result = self.collection(bucket).delete_one(doc! { "_id": key }, None)?;
        Ok(result.deleted_count > 0)
    }

    fn query_exact(&self, bucket: &str, index: Index, value: &IndexValue) -> Result<Vec<String>> {
        let mut filter = Document::new();
        filter.insert(index.field(), index_bson(value));
        self.keys_matching(bucket, filter)
    }

    fn query_range(&self, bucket: &str, index: Index, min: i64, max: i64) -> Result<Vec<String>> {
        let mut filter = Document::new();
        filter.insert(index.field(), doc! { "$gte": min, "$lte": max });
        self.keys_matching(bucket, filter)
    }

    fn list_people(&self, trace: &mut Tracer) -> Result<Vec<Person>> {
        let people = self.find_people(doc! {})?;
        trace.db(format!("{} documents returned by one cursor", people.len()));
        Ok(people)
    }

    fn insert_person(&self, person: &Person, trace: &mut Tracer) -> Result<()> {
        let doc = to_doc(&person.national_id, &person.to_record()?)?;
        match self.people().insert_one(doc, None) {
            Ok(_) => {
                trace.db("insertOne acknowledged");
                Ok(())
            }
            Err(e) if is_duplicate(&e) => Err(DbError::DuplicateKey(person.national_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn increment_income(&self, dni: &str, delta: i64, trace: &mut Tracer) -> Result<Option<Person>> {
        let current = match self.get_person(dni)? {
            Some(person) => person,
            None => return Ok(None),
        };
        incremented(&current, delta)?;
        let result = self
            .people()
            .update_one(doc! { "_id": dni }, doc! { "$inc": { "ingresos": delta } }, None)?;
        if result.matched_count == 0 {
            return Ok(None);
        }
        trace.db("$inc applied server-side, the indexes follow the document");
        self.get_person(dni)
    }

    fn income_range(&self, min: i64, max: i64, trace: &mut Tracer) -> Result<Vec<Person>> {
        let people = self.find_people(doc! { "ingresos": { "$gte": min, "$lte": max } })?;
        trace.db(format!("B-tree range scan returned {} documents", people.len()));
        Ok(people)
    }

    fn filter_sector_sex(&self, sector: u32, sex: Sex, trace: &mut Tracer) -> Result<Vec<Person>> {
        let people = self.find_people(doc! { "sector": i64::from(sector), "sexo": sex.code() })?;
        trace.db(format!("compound index lookup returned {} documents", people.len()));
        Ok(people)
    }

    fn income_by_sector(&self, trace: &mut Tracer) -> Result<Vec<SectorTotal>> {
        let mut totals = Vec::new();
        for row in self.people().aggregate(group_by_sector(), None)? {
            let row = row?;
            match (as_i64(row.get("_id")), as_i64(row.get(TOTAL_FIELD))) {
                (Some(sector), Some(total)) if sector >= 0 => totals.push(SectorTotal {
                    sector: sector as u32,
                    total,
                }),
                _ => trace.warn(format!("skipping aggregation row {}", row)),
            }
        }
        trace.db(format!("aggregation pipeline grouped {} sectors", totals.len()));
        self.save_summary(&totals, trace)?;
        Ok(totals)
    }

    fn save_summary(&self, totals: &[SectorTotal], trace: &mut Tracer) -> Result<()> {
        let summary = self.collection(SUMMARIES);
        summary.delete_many(doc! {}, None)?;
        let docs: Vec<Document> = totals
            .iter()
            .map(summary_row)
            .collect();
        if !docs.is_empty() {
            summary.insert_many(docs, None)?;
        }
        trace.db(format!("{} rows written to {}", totals.len(), SUMMARY_KEY));
        Ok(())
    }

    fn reindex(&self, trace: &mut Tracer) -> Result<Value> {
        self.create_indexes(trace)?;
        let names = self.people().list_index_names()?;
        trace.success(format!("{} indexes on poblacion", names.len()));
        Ok(json!({ "indexes": names }))
    }

    fn drop_indexes(&self, trace: &mut Tracer) -> Result<()> {
        match self.people().drop_indexes(None) {
            Ok(()) => trace.db("secondary indexes dropped"),
            Err(e) if is_missing_namespace(&e) => trace.warn("collection does not exist yet, nothing to drop"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn create_indexes(&self, trace: &mut Tracer) -> Result<()> {
        let people = self.people();
        people.create_index(IndexModel::builder().keys(doc! { "ingresos": 1 }).build(), None)?;
        people.create_index(
            IndexModel::builder().keys(doc! { "sector": 1, "sexo": 1 }).build(),
            None,
        )?;
        trace.success("B-tree indexes ensured on ingresos and (sector, sexo)");
        Ok(())
    }

    fn clear(&self, bucket: &str) -> Result<usize> {
        let result = self.collection(bucket).delete_many(doc! {}, None)?;
        Ok(result.deleted_count as usize)
    }

    fn put_batch(&self, bucket: &str, records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let docs = records
            .iter()
            .map(|r| to_doc(&r.key, &r.value))
            .collect::<Result<Vec<Document>>>()?;
        let options = InsertManyOptions::builder().ordered(false).build();
        let result = self.collection(bucket).insert_many(docs, options)?;
        Ok(result.inserted_ids.len())
    }

    fn count(&self, bucket: &str) -> Result<usize> {
        Ok(self.collection(bucket).count_documents(None, None)? as usize)
    }
}

/// the server-side pipeline summing incomes per sector, one row per sector ordered by code
fn group_by_sector() -> Vec<Document> {
    let mut group = doc! { "_id": "$sector" };
    group.insert(TOTAL_FIELD, doc! { "$sum": "$ingresos" });
    vec![doc! { "$group": group }, doc! { "$sort": { "_id": 1 } }]
}

/// one document of the summary collection
fn summary_row(t: &SectorTotal) -> Document {
    let mut row = doc! { "_id": i64::from(t.sector) };
    row.insert(TOTAL_FIELD, t.total);
    row
}
