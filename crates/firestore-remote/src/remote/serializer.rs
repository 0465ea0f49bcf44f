//! Translation between the domain model and wire messages.
//!
//! The transport treats encoded messages as opaque bytes; [`Serializer`] is
//! the only place that knows their shape. [`RemoteSerializer`] speaks the
//! `google.firestore.v1` messages from [`firestore_remote_core::proto`].

use bytes::Bytes;
use firestore_remote_core::{
    DatabaseId, Error, Result,
    model::{
        DocumentKey, FieldValue, MaybeDocument, Mutation, MutationResult, ObjectValue,
        Precondition, SnapshotVersion, WriteResponse,
    },
    proto,
};
use prost::Message;
use prost_types::Timestamp;
use std::collections::BTreeMap;

pub trait Serializer: Send + Sync + 'static {
    /// The first request on every write stream.
    fn encode_handshake(&self) -> Bytes;

    /// A mutation batch, resuming from `stream_token`.
    fn encode_write_mutations(&self, mutations: &[Mutation], stream_token: &Bytes) -> Bytes;

    fn decode_write_response(&self, message: &[u8]) -> Result<WriteResponse>;

    fn encode_commit(&self, mutations: &[Mutation]) -> Bytes;

    fn encode_lookup(&self, keys: &[DocumentKey]) -> Bytes;

    /// Decodes one response of a lookup stream.
    fn decode_lookup_response(&self, message: &[u8]) -> Result<MaybeDocument>;
}

/// [`Serializer`] for one database.
#[derive(Clone, Debug)]
pub struct RemoteSerializer {
    database_id: DatabaseId,
    database_name: String,
}

impl RemoteSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        let database_name = database_id.name();
        Self {
            database_id,
            database_name,
        }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    /// `projects/{p}/databases/{d}/documents/{path}`
    pub fn encode_key(&self, key: &DocumentKey) -> String {
        format!("{}/documents/{}", self.database_name, key.path())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidResponse`] if `name` belongs to another
    /// database or is not a document path.
    pub fn decode_key(&self, name: &str) -> Result<DocumentKey> {
        let path = name
            .strip_prefix(self.database_name.as_str())
            .and_then(|rest| rest.strip_prefix("/documents/"))
            .ok_or_else(|| Error::InvalidResponse {
                reason: format!("document name '{name}' is outside {}", self.database_name),
            })?;

        DocumentKey::from_path(path).map_err(|e| Error::InvalidResponse {
            reason: e.to_string(),
        })
    }

    fn encode_mutation(&self, mutation: &Mutation) -> proto::Write {
        let current_document = encode_precondition(mutation.precondition());
        match mutation {
            Mutation::Set { key, value, .. } => proto::Write {
                operation: Some(proto::write::Operation::Update(
                    self.encode_document(key, value),
                )),
                update_mask: None,
                current_document,
            },
            Mutation::Patch {
                key,
                value,
                field_mask,
                ..
            } => proto::Write {
                operation: Some(proto::write::Operation::Update(
                    self.encode_document(key, value),
                )),
                update_mask: Some(proto::DocumentMask {
                    field_paths: field_mask.clone(),
                }),
                current_document,
            },
            Mutation::Delete { key, .. } => proto::Write {
                operation: Some(proto::write::Operation::Delete(self.encode_key(key))),
                update_mask: None,
                current_document,
            },
        }
    }

    fn encode_document(&self, key: &DocumentKey, value: &ObjectValue) -> proto::Document {
        proto::Document {
            name: self.encode_key(key),
            fields: encode_fields(value),
            create_time: None,
            update_time: None,
        }
    }
}

impl Serializer for RemoteSerializer {
    fn encode_handshake(&self) -> Bytes {
        proto::WriteRequest {
            database: self.database_name.clone(),
            ..Default::default()
        }
        .encode_to_vec()
        .into()
    }

    fn encode_write_mutations(&self, mutations: &[Mutation], stream_token: &Bytes) -> Bytes {
        proto::WriteRequest {
            database: String::new(),
            stream_id: String::new(),
            writes: mutations.iter().map(|m| self.encode_mutation(m)).collect(),
            stream_token: stream_token.clone(),
        }
        .encode_to_vec()
        .into()
    }

    fn decode_write_response(&self, message: &[u8]) -> Result<WriteResponse> {
        let response = proto::WriteResponse::decode(message)?;
        let commit_version = decode_version(response.commit_time.as_ref());

        let mutation_results = response
            .write_results
            .iter()
            .map(|result| MutationResult {
                version: result
                    .update_time
                    .as_ref()
                    .map_or(commit_version, decode_timestamp),
            })
            .collect();

        Ok(WriteResponse {
            stream_token: response.stream_token,
            commit_version,
            mutation_results,
        })
    }

    fn encode_commit(&self, mutations: &[Mutation]) -> Bytes {
        proto::CommitRequest {
            database: self.database_name.clone(),
            writes: mutations.iter().map(|m| self.encode_mutation(m)).collect(),
        }
        .encode_to_vec()
        .into()
    }

    fn encode_lookup(&self, keys: &[DocumentKey]) -> Bytes {
        proto::BatchGetDocumentsRequest {
            database: self.database_name.clone(),
            documents: keys.iter().map(|key| self.encode_key(key)).collect(),
        }
        .encode_to_vec()
        .into()
    }

    fn decode_lookup_response(&self, message: &[u8]) -> Result<MaybeDocument> {
        use proto::batch_get_documents_response::Result as Found;

        let response = proto::BatchGetDocumentsResponse::decode(message)?;
        match response.result {
            Some(Found::Found(document)) => {
                let key = self.decode_key(&document.name)?;
                let version = document
                    .update_time
                    .as_ref()
                    .map(decode_timestamp)
                    .ok_or_else(|| Error::InvalidResponse {
                        reason: format!("found document '{key}' has no update time"),
                    })?;
                Ok(MaybeDocument::Document {
                    key,
                    version,
                    data: decode_fields(document.fields),
                })
            }
            Some(Found::Missing(name)) => {
                let key = self.decode_key(&name)?;
                let version = response
                    .read_time
                    .as_ref()
                    .map(decode_timestamp)
                    .ok_or_else(|| Error::InvalidResponse {
                        reason: format!("missing document '{key}' has no read time"),
                    })?;
                Ok(MaybeDocument::NoDocument { key, version })
            }
            None => Err(Error::InvalidResponse {
                reason: "lookup response carries neither a document nor a missing name"
                    .to_string(),
            }),
        }
    }
}

fn encode_precondition(precondition: Precondition) -> Option<proto::Precondition> {
    use proto::precondition::ConditionType;

    let condition_type = match precondition {
        Precondition::None => return None,
        Precondition::Exists(exists) => ConditionType::Exists(exists),
        Precondition::UpdateTime(version) => ConditionType::UpdateTime(encode_timestamp(version)),
    };
    Some(proto::Precondition {
        condition_type: Some(condition_type),
    })
}

fn encode_fields(value: &ObjectValue) -> BTreeMap<String, proto::Value> {
    value
        .iter()
        .map(|(name, field)| (name.clone(), encode_value(field)))
        .collect()
}

fn decode_fields(fields: BTreeMap<String, proto::Value>) -> ObjectValue {
    fields
        .into_iter()
        .map(|(name, value)| (name, decode_value(value)))
        .collect()
}

fn encode_value(value: &FieldValue) -> proto::Value {
    use proto::value::ValueType;

    let value_type = match value {
        FieldValue::Null => ValueType::NullValue(prost_types::NullValue::NullValue as i32),
        FieldValue::Boolean(b) => ValueType::BooleanValue(*b),
        FieldValue::Integer(i) => ValueType::IntegerValue(*i),
        FieldValue::Double(d) => ValueType::DoubleValue(*d),
        FieldValue::String(s) => ValueType::StringValue(s.clone()),
        FieldValue::Bytes(b) => ValueType::BytesValue(b.clone()),
        FieldValue::Array(values) => ValueType::ArrayValue(proto::ArrayValue {
            values: values.iter().map(encode_value).collect(),
        }),
        FieldValue::Map(fields) => ValueType::MapValue(proto::MapValue {
            fields: encode_fields(fields),
        }),
    };
    proto::Value {
        value_type: Some(value_type),
    }
}

fn decode_value(value: proto::Value) -> FieldValue {
    use proto::value::ValueType;

    match value.value_type {
        None | Some(ValueType::NullValue(_)) => FieldValue::Null,
        Some(ValueType::BooleanValue(b)) => FieldValue::Boolean(b),
        Some(ValueType::IntegerValue(i)) => FieldValue::Integer(i),
        Some(ValueType::DoubleValue(d)) => FieldValue::Double(d),
        Some(ValueType::StringValue(s)) => FieldValue::String(s),
        Some(ValueType::BytesValue(b)) => FieldValue::Bytes(b),
        Some(ValueType::ArrayValue(array)) => {
            FieldValue::Array(array.values.into_iter().map(decode_value).collect())
        }
        Some(ValueType::MapValue(map)) => FieldValue::Map(decode_fields(map.fields)),
    }
}

fn encode_timestamp(version: SnapshotVersion) -> Timestamp {
    Timestamp {
        seconds: version.seconds,
        nanos: version.nanos,
    }
}

fn decode_timestamp(timestamp: &Timestamp) -> SnapshotVersion {
    SnapshotVersion::new(timestamp.seconds, timestamp.nanos)
}

fn decode_version(timestamp: Option<&Timestamp>) -> SnapshotVersion {
    timestamp.map_or(SnapshotVersion::NONE, decode_timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serializer() -> RemoteSerializer {
        RemoteSerializer::new(DatabaseId::new("p", "d"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_path(path).unwrap()
    }

    #[test]
    fn handshake_names_only_the_database() {
        let request = proto::WriteRequest::decode(serializer().encode_handshake()).unwrap();
        assert_eq!(request.database, "projects/p/databases/d");
        assert!(request.writes.is_empty());
        assert!(request.stream_token.is_empty());
    }

    #[test]
    fn write_mutations_carry_the_stream_token() {
        let mut value = ObjectValue::new();
        value.insert("n".to_string(), FieldValue::Integer(7));
        let mutations = vec![
            Mutation::set(key("rooms/a"), value.clone()),
            Mutation::Patch {
                key: key("rooms/b"),
                value,
                field_mask: vec!["n".to_string()],
                precondition: Precondition::Exists(true),
            },
            Mutation::delete(key("rooms/c")),
        ];

        let token = Bytes::from_static(b"token-1");
        let request = proto::WriteRequest::decode(
            serializer().encode_write_mutations(&mutations, &token),
        )
        .unwrap();

        assert_eq!(request.stream_token, token);
        assert_eq!(request.writes.len(), 3);

        match &request.writes[0].operation {
            Some(proto::write::Operation::Update(document)) => {
                assert_eq!(document.name, "projects/p/databases/d/documents/rooms/a");
                assert_eq!(
                    document.fields.get("n").and_then(|v| v.value_type.clone()),
                    Some(proto::value::ValueType::IntegerValue(7))
                );
            }
            other => panic!("unexpected operation: {other:?}"),
        }
        assert!(request.writes[0].update_mask.is_none());
        assert_eq!(
            request.writes[1].update_mask.as_ref().unwrap().field_paths,
            vec!["n".to_string()]
        );
        assert_eq!(
            request.writes[1].current_document,
            Some(proto::Precondition {
                condition_type: Some(proto::precondition::ConditionType::Exists(true)),
            })
        );
        assert_eq!(
            request.writes[2].operation,
            Some(proto::write::Operation::Delete(
                "projects/p/databases/d/documents/rooms/c".to_string()
            ))
        );
    }

    #[test]
    fn write_result_without_update_time_takes_commit_version() {
        let response = proto::WriteResponse {
            stream_id: String::new(),
            stream_token: Bytes::from_static(b"t2"),
            write_results: vec![
                proto::WriteResult {
                    update_time: Some(Timestamp {
                        seconds: 5,
                        nanos: 1,
                    }),
                    transform_results: vec![],
                },
                proto::WriteResult::default(),
            ],
            commit_time: Some(Timestamp {
                seconds: 9,
                nanos: 0,
            }),
        };

        let decoded = serializer()
            .decode_write_response(&response.encode_to_vec())
            .unwrap();
        assert_eq!(decoded.stream_token, Bytes::from_static(b"t2"));
        assert_eq!(decoded.commit_version, SnapshotVersion::new(9, 0));
        assert_eq!(decoded.mutation_results[0].version, SnapshotVersion::new(5, 1));
        assert_eq!(decoded.mutation_results[1].version, SnapshotVersion::new(9, 0));
    }

    #[test]
    fn undecodable_write_response_is_a_decode_error() {
        let result = serializer().decode_write_response(&[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn lookup_response_found_and_missing() {
        let serializer = serializer();

        let mut fields = BTreeMap::new();
        fields.insert(
            "title".to_string(),
            encode_value(&FieldValue::String("hi".to_string())),
        );
        let found = proto::BatchGetDocumentsResponse {
            result: Some(proto::batch_get_documents_response::Result::Found(
                proto::Document {
                    name: "projects/p/databases/d/documents/rooms/a".to_string(),
                    fields,
                    create_time: None,
                    update_time: Some(Timestamp {
                        seconds: 3,
                        nanos: 0,
                    }),
                },
            )),
            transaction: Bytes::new(),
            read_time: None,
        };
        let document = serializer
            .decode_lookup_response(&found.encode_to_vec())
            .unwrap();
        assert!(document.exists());
        assert_eq!(document.key(), &key("rooms/a"));
        assert_eq!(document.version(), SnapshotVersion::new(3, 0));

        let missing = proto::BatchGetDocumentsResponse {
            result: Some(proto::batch_get_documents_response::Result::Missing(
                "projects/p/databases/d/documents/rooms/b".to_string(),
            )),
            transaction: Bytes::new(),
            read_time: Some(Timestamp {
                seconds: 4,
                nanos: 0,
            }),
        };
        let document = serializer
            .decode_lookup_response(&missing.encode_to_vec())
            .unwrap();
        assert!(!document.exists());
        assert_eq!(document.version(), SnapshotVersion::new(4, 0));
    }

    #[test]
    fn foreign_document_name_is_rejected() {
        let result = serializer().decode_key("projects/other/databases/d/documents/rooms/a");
        assert!(matches!(result, Err(Error::InvalidResponse { .. })));
    }

    #[test]
    fn nested_values_survive_encoding() {
        let mut inner = ObjectValue::new();
        inner.insert("flag".to_string(), FieldValue::Boolean(true));
        let value = FieldValue::Array(vec![
            FieldValue::Null,
            FieldValue::Double(1.5),
            FieldValue::Bytes(Bytes::from_static(b"\x00\x01")),
            FieldValue::Map(inner),
        ]);
        assert_eq!(decode_value(encode_value(&value)), value);
    }
}
