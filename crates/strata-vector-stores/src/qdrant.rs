//! Qdrant vector store implementation.

use async_trait::async_trait;
use std::collections::HashMap;

use strata_core::error::{ErrorCode, StrataError, StrataResult};
use strata_core::traits::{
    CollectionInfo, DistanceMetric, ScrollPage, VectorRecord, VectorStore, VectorStoreConfig,
};
use strata_core::types::{Filter, FilterCondition, FilterOperator};

use qdrant_client::qdrant::{
    point_id::PointIdOptions, r#match::MatchValue, vectors_config::Config,
    vectors_output::VectorsOptions, Condition, CountPointsBuilder, Distance, FieldCondition,
    Filter as QdrantFilter, GetPointsBuilder, Match, PointId, PointStruct, PointsIdsList, Range,
    RepeatedIntegers, RepeatedStrings, ScrollPointsBuilder, SearchPointsBuilder,
    SetPayloadPointsBuilder, UpsertPointsBuilder, Value, VectorsOutput,
};
use qdrant_client::{Qdrant, QdrantError};

/// Qdrant vector store implementation.
pub struct QdrantVectorStore {
    client: Qdrant,
    config: VectorStoreConfig,
}

impl QdrantVectorStore {
    /// Create a new Qdrant vector store. No request is made until first use.
    pub async fn new(config: VectorStoreConfig) -> StrataResult<Self> {
        let url = config
            .config
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or("http://localhost:6334");

        let api_key = config
            .config
            .get("api_key")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| std::env::var("QDRANT_API_KEY").ok());

        let mut builder = Qdrant::from_url(url);
        if let Some(key) = api_key {
            builder = builder.api_key(key);
        }
        let client = builder.build().map_err(|e| {
            StrataError::Configuration(format!("Failed to create Qdrant client: {}", e))
        })?;

        tracing::debug!(url, collection = %config.collection_name, "Qdrant client created");
        Ok(Self { client, config })
    }

    fn store_error(operation: &str, error: QdrantError) -> StrataError {
        let code = match &error {
            QdrantError::ResponseError { status } => {
                match format!("{:?}", status.code()).as_str() {
                    "Unavailable" | "DeadlineExceeded" => ErrorCode::VecConnectionFailed,
                    "NotFound" => ErrorCode::VecCollectionNotFound,
                    _ => ErrorCode::VecOperationFailed,
                }
            }
            _ => ErrorCode::VecConnectionFailed,
        };
        StrataError::VectorStore {
            message: format!("Qdrant {} failed: {}", operation, error),
            code,
            source: Some(Box::new(error)),
        }
    }

    fn qdrant_to_distance(distance: i32) -> DistanceMetric {
        match Distance::try_from(distance) {
            Ok(Distance::Euclid) => DistanceMetric::Euclidean,
            Ok(Distance::Dot) => DistanceMetric::DotProduct,
            _ => DistanceMetric::Cosine,
        }
    }

    fn payload_to_hashmap(payload: HashMap<String, Value>) -> HashMap<String, serde_json::Value> {
        payload
            .into_iter()
            .map(|(k, v)| (k, Self::qdrant_value_to_json(v)))
            .collect()
    }

    fn hashmap_to_payload(payload: HashMap<String, serde_json::Value>) -> HashMap<String, Value> {
        payload
            .into_iter()
            .map(|(k, v)| (k, Self::json_to_qdrant_value(v)))
            .collect()
    }

    fn qdrant_value_to_json(value: Value) -> serde_json::Value {
        use qdrant_client::qdrant::value::Kind;
        match value.kind {
            Some(Kind::NullValue(_)) | None => serde_json::Value::Null,
            Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
            Some(Kind::IntegerValue(i)) => serde_json::Value::Number(i.into()),
            Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Some(Kind::StringValue(s)) => serde_json::Value::String(s),
            Some(Kind::ListValue(list)) => serde_json::Value::Array(
                list.values
                    .into_iter()
                    .map(Self::qdrant_value_to_json)
                    .collect(),
            ),
            Some(Kind::StructValue(s)) => serde_json::Value::Object(
                s.fields
                    .into_iter()
                    .map(|(k, v)| (k, Self::qdrant_value_to_json(v)))
                    .collect(),
            ),
        }
    }

    fn json_to_qdrant_value(value: serde_json::Value) -> Value {
        use qdrant_client::qdrant::value::Kind;
        use qdrant_client::qdrant::{ListValue, Struct};

        let kind = match value {
            serde_json::Value::Null => Kind::NullValue(0),
            serde_json::Value::Bool(b) => Kind::BoolValue(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Kind::IntegerValue(i)
                } else if let Some(f) = n.as_f64() {
                    Kind::DoubleValue(f)
                } else {
                    Kind::NullValue(0)
                }
            }
            serde_json::Value::String(s) => Kind::StringValue(s),
            serde_json::Value::Array(arr) => Kind::ListValue(ListValue {
                values: arr.into_iter().map(Self::json_to_qdrant_value).collect(),
            }),
            serde_json::Value::Object(obj) => Kind::StructValue(Struct {
                fields: obj
                    .into_iter()
                    .map(|(k, v)| (k, Self::json_to_qdrant_value(v)))
                    .collect(),
            }),
        };

        Value { kind: Some(kind) }
    }

    fn convert_filter(filter: &Filter) -> QdrantFilter {
        match filter {
            Filter::Condition(cond) => Self::convert_condition(cond),
            Filter::And(filters) => QdrantFilter {
                must: filters.iter().map(Self::nested).collect(),
                ..Default::default()
            },
            Filter::Or(filters) => QdrantFilter {
                should: filters.iter().map(Self::nested).collect(),
                ..Default::default()
            },
            Filter::Not(inner) => QdrantFilter {
                must_not: vec![Self::nested(inner)],
                ..Default::default()
            },
        }
    }

    fn nested(filter: &Filter) -> Condition {
        Condition::from(Self::convert_filter(filter))
    }

    /// Absent, null, empty list or empty string.
    fn empty_field(field: &str) -> QdrantFilter {
        QdrantFilter {
            should: vec![
                Condition::is_empty(field),
                Condition::is_null(field),
                Condition::matches(field, String::new()),
            ],
            ..Default::default()
        }
    }

    fn convert_condition(cond: &FilterCondition) -> QdrantFilter {
        let field = cond.field.as_str();
        let must = |condition: FieldCondition| QdrantFilter {
            must: vec![Condition::from(condition)],
            ..Default::default()
        };
        let range = |range: Range| {
            must(FieldCondition {
                key: field.to_string(),
                range: Some(range),
                ..Default::default()
            })
        };

        match &cond.operator {
            FilterOperator::Eq(value) => must(Self::match_field(field, value)),
            FilterOperator::Ne(value) => QdrantFilter {
                must_not: vec![Condition::from(Self::match_field(field, value))],
                ..Default::default()
            },
            FilterOperator::Gt(value) => range(Range {
                gt: value.as_f64(),
                ..Default::default()
            }),
            FilterOperator::Gte(value) => range(Range {
                gte: value.as_f64(),
                ..Default::default()
            }),
            FilterOperator::Lt(value) => range(Range {
                lt: value.as_f64(),
                ..Default::default()
            }),
            FilterOperator::Lte(value) => range(Range {
                lte: value.as_f64(),
                ..Default::default()
            }),
            FilterOperator::In(values) => {
                let match_value = if values.iter().all(|v| v.is_i64()) {
                    MatchValue::Integers(RepeatedIntegers {
                        integers: values.iter().filter_map(|v| v.as_i64()).collect(),
                    })
                } else {
                    MatchValue::Keywords(RepeatedStrings {
                        strings: values
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect(),
                    })
                };
                must(FieldCondition {
                    key: field.to_string(),
                    r#match: Some(Match {
                        match_value: Some(match_value),
                    }),
                    ..Default::default()
                })
            }
            FilterOperator::Exists => QdrantFilter {
                must_not: vec![Condition::from(Self::empty_field(field))],
                ..Default::default()
            },
            FilterOperator::NotExists => QdrantFilter {
                must: vec![Condition::from(Self::empty_field(field))],
                ..Default::default()
            },
        }
    }

    fn match_field(field: &str, value: &serde_json::Value) -> FieldCondition {
        let match_value = match value {
            serde_json::Value::String(s) => Some(MatchValue::Keyword(s.clone())),
            serde_json::Value::Number(n) => n.as_i64().map(MatchValue::Integer),
            serde_json::Value::Bool(b) => Some(MatchValue::Boolean(*b)),
            _ => None,
        };
        FieldCondition {
            key: field.to_string(),
            r#match: Some(Match { match_value }),
            ..Default::default()
        }
    }

    /// Numeric ids are sent as numbers, everything else as a UUID string.
    fn point_id(id: &str) -> PointId {
        match id.parse::<u64>() {
            Ok(num) => PointId::from(num),
            Err(_) => PointId::from(id.to_string()),
        }
    }

    fn extract_point_id(point_id: Option<PointId>) -> String {
        match point_id.and_then(|p| p.point_id_options) {
            Some(PointIdOptions::Uuid(uuid)) => uuid,
            Some(PointIdOptions::Num(num)) => num.to_string(),
            None => String::new(),
        }
    }

    fn extract_vector(vectors: Option<VectorsOutput>) -> Vec<f32> {
        match vectors.and_then(|v| v.vectors_options) {
            Some(VectorsOptions::Vector(v)) => v.data,
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn require_collection(&self) -> StrataResult<CollectionInfo> {
        let name = self.collection_name();
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(|e| Self::store_error("collection_exists", e))?;
        if !exists {
            return Err(StrataError::VectorStore {
                message: format!("Collection '{}' does not exist", name),
                code: ErrorCode::VecCollectionNotFound,
                source: None,
            });
        }

        let response = self
            .client
            .collection_info(name)
            .await
            .map_err(|e| Self::store_error("collection_info", e))?;
        let info = response
            .result
            .ok_or_else(|| StrataError::vector_store("No collection info in response"))?;

        let (dimension, distance) = match info
            .config
            .as_ref()
            .and_then(|c| c.params.as_ref())
            .and_then(|p| p.vectors_config.as_ref())
            .and_then(|vc| vc.config.as_ref())
        {
            Some(Config::Params(p)) => (p.size as usize, Self::qdrant_to_distance(p.distance)),
            _ => (self.config.embedding_model_dims, DistanceMetric::Cosine),
        };

        Ok(CollectionInfo {
            name: name.to_string(),
            vector_count: info.points_count.unwrap_or(0),
            dimension,
            distance,
        })
    }

    async fn scroll(
        &self,
        filter: Option<Filter>,
        offset: Option<String>,
        limit: usize,
    ) -> StrataResult<ScrollPage> {
        let mut request = ScrollPointsBuilder::new(self.collection_name())
            .limit(limit.max(1) as u32)
            .with_payload(true)
            .with_vectors(true);

        if let Some(f) = filter {
            request = request.filter(Self::convert_filter(&f));
        }
        if let Some(o) = offset.filter(|o| !o.is_empty()) {
            request = request.offset(Self::point_id(&o));
        }

        let response = self
            .client
            .scroll(request)
            .await
            .map_err(|e| Self::store_error("scroll", e))?;

        let points = response
            .result
            .into_iter()
            .map(|point| VectorRecord {
                id: Self::extract_point_id(point.id),
                vector: Self::extract_vector(point.vectors),
                payload: Self::payload_to_hashmap(point.payload),
                score: None,
            })
            .collect();

        Ok(ScrollPage {
            points,
            next_offset: response
                .next_page_offset
                .map(|id| Self::extract_point_id(Some(id))),
        })
    }

    async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
        filter: Option<Filter>,
    ) -> StrataResult<Vec<VectorRecord>> {
        let mut request =
            SearchPointsBuilder::new(self.collection_name(), query_vector.to_vec(), limit as u64)
                .with_payload(true)
                .with_vectors(true);

        if let Some(f) = filter {
            request = request.filter(Self::convert_filter(&f));
        }

        let response = self
            .client
            .search_points(request)
            .await
            .map_err(|e| Self::store_error("search", e))?;

        Ok(response
            .result
            .into_iter()
            .map(|point| VectorRecord {
                id: Self::extract_point_id(point.id),
                vector: Self::extract_vector(point.vectors),
                payload: Self::payload_to_hashmap(point.payload),
                score: Some(point.score),
            })
            .collect())
    }

    async fn retrieve(&self, ids: &[String]) -> StrataResult<Vec<VectorRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let point_ids: Vec<PointId> = ids.iter().map(|id| Self::point_id(id)).collect();
        let request = GetPointsBuilder::new(self.collection_name(), point_ids)
            .with_payload(true)
            .with_vectors(true);

        let response = self
            .client
            .get_points(request)
            .await
            .map_err(|e| Self::store_error("retrieve", e))?;

        Ok(response
            .result
            .into_iter()
            .map(|point| VectorRecord {
                id: Self::extract_point_id(point.id),
                vector: Self::extract_vector(point.vectors),
                payload: Self::payload_to_hashmap(point.payload),
                score: None,
            })
            .collect())
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> StrataResult<()> {
        let points: Vec<PointStruct> = records
            .into_iter()
            .map(|record| {
                PointStruct::new(
                    Self::point_id(&record.id),
                    record.vector,
                    Self::hashmap_to_payload(record.payload),
                )
            })
            .collect();

        let request = UpsertPointsBuilder::new(self.collection_name(), points).wait(true);

        self.client
            .upsert_points(request)
            .await
            .map_err(|e| Self::store_error("upsert", e))?;

        Ok(())
    }

    async fn set_payload(
        &self,
        id: &str,
        payload: HashMap<String, serde_json::Value>,
    ) -> StrataResult<()> {
        let request =
            SetPayloadPointsBuilder::new(self.collection_name(), Self::hashmap_to_payload(payload))
                .points_selector(PointsIdsList {
                    ids: vec![Self::point_id(id)],
                })
                .wait(true);

        self.client
            .set_payload(request)
            .await
            .map_err(|e| Self::store_error("set_payload", e))?;

        Ok(())
    }

    async fn count(&self, filter: Option<Filter>) -> StrataResult<u64> {
        let mut request = CountPointsBuilder::new(self.collection_name()).exact(true);
        if let Some(f) = filter {
            request = request.filter(Self::convert_filter(&f));
        }

        let response = self
            .client
            .count(request)
            .await
            .map_err(|e| Self::store_error("count", e))?;

        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }

    fn collection_name(&self) -> &str {
        &self.config.collection_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qdrant_client::qdrant::condition::ConditionOneOf;
    use strata_core::consolidation::level_filter;

    #[test]
    fn test_level_filter_translation() {
        let filter = QdrantVectorStore::convert_filter(&level_filter(2));
        assert_eq!(filter.must.len(), 2);
        assert!(filter.should.is_empty());

        let nested: Vec<&QdrantFilter> = filter
            .must
            .iter()
            .filter_map(|c| match &c.condition_one_of {
                Some(ConditionOneOf::Filter(f)) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(nested.len(), 2);
        // The not-superseded half matches absent, null, or empty values.
        assert!(nested.iter().any(|f| f
            .must
            .iter()
            .any(|c| matches!(&c.condition_one_of, Some(ConditionOneOf::Filter(inner)) if inner.should.len() == 3))));
    }

    #[test]
    fn test_ne_becomes_must_not() {
        let filter = QdrantVectorStore::convert_condition(&FilterCondition::ne("content", "x"));
        assert!(filter.must.is_empty());
        assert_eq!(filter.must_not.len(), 1);
    }

    #[test]
    fn test_point_ids() {
        let num = QdrantVectorStore::point_id("42");
        assert_eq!(QdrantVectorStore::extract_point_id(Some(num)), "42");

        let uuid = "5f0c8a6e-3b7a-4d8e-9a39-2a0c1f0b9b11";
        let id = QdrantVectorStore::point_id(uuid);
        assert_eq!(QdrantVectorStore::extract_point_id(Some(id)), uuid);
        assert_eq!(QdrantVectorStore::extract_point_id(None), "");
    }

    #[test]
    fn test_payload_round_trip_preserves_nesting() {
        let payload: HashMap<String, serde_json::Value> = [
            ("content".to_string(), serde_json::json!("likes pizza")),
            ("source_ids".to_string(), serde_json::json!(["a", "b"])),
            ("consolidation_level".to_string(), serde_json::json!(1)),
            ("extra".to_string(), serde_json::json!({"k": 1.5})),
        ]
        .into_iter()
        .collect();

        let back = QdrantVectorStore::payload_to_hashmap(QdrantVectorStore::hashmap_to_payload(
            payload.clone(),
        ));
        assert_eq!(back, payload);
    }
}
