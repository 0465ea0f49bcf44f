//! Wire messages for the subset of `google.firestore.v1` the transport speaks.
//!
//! The messages are derived by hand with [`prost`] rather than generated, and
//! carry the same field tags as the published schema so they interoperate with
//! the real service. Only the fields the transport reads or writes are
//! declared; prost skips unknown fields on decode.
//!
//! ## Write stream
//!
//! - [`WriteRequest`] - The handshake (only `database` set) and every
//!   mutation batch (`writes` plus the last `stream_token`).
//! - [`WriteResponse`] - The handshake response and every write
//!   acknowledgement; both carry a fresh `stream_token`.
//!
//! ## Unary / server streaming
//!
//! - [`CommitRequest`] / [`CommitResponse`]
//! - [`BatchGetDocumentsRequest`] / [`BatchGetDocumentsResponse`]

use bytes::Bytes;
use prost_types::Timestamp;
use std::collections::BTreeMap;

/// A field value.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Value {
    #[prost(oneof = "value::ValueType", tags = "11, 1, 2, 3, 17, 18, 9, 6")]
    pub value_type: Option<value::ValueType>,
}

pub mod value {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum ValueType {
        #[prost(enumeration = "prost_types::NullValue", tag = "11")]
        NullValue(i32),
        #[prost(bool, tag = "1")]
        BooleanValue(bool),
        #[prost(int64, tag = "2")]
        IntegerValue(i64),
        #[prost(double, tag = "3")]
        DoubleValue(f64),
        #[prost(string, tag = "17")]
        StringValue(String),
        #[prost(bytes = "bytes", tag = "18")]
        BytesValue(bytes::Bytes),
        #[prost(message, tag = "9")]
        ArrayValue(super::ArrayValue),
        #[prost(message, tag = "6")]
        MapValue(super::MapValue),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ArrayValue {
    #[prost(message, repeated, tag = "1")]
    pub values: Vec<Value>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MapValue {
    #[prost(btree_map = "string, message", tag = "1")]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Document {
    /// `projects/{p}/databases/{d}/documents/{path}`
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(btree_map = "string, message", tag = "2")]
    pub fields: BTreeMap<String, Value>,
    #[prost(message, optional, tag = "3")]
    pub create_time: Option<Timestamp>,
    #[prost(message, optional, tag = "4")]
    pub update_time: Option<Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DocumentMask {
    #[prost(string, repeated, tag = "1")]
    pub field_paths: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Precondition {
    #[prost(oneof = "precondition::ConditionType", tags = "1, 2")]
    pub condition_type: Option<precondition::ConditionType>,
}

pub mod precondition {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum ConditionType {
        #[prost(bool, tag = "1")]
        Exists(bool),
        #[prost(message, tag = "2")]
        UpdateTime(prost_types::Timestamp),
    }
}

/// A single mutation on the wire.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Write {
    #[prost(oneof = "write::Operation", tags = "1, 2")]
    pub operation: Option<write::Operation>,
    #[prost(message, optional, tag = "3")]
    pub update_mask: Option<DocumentMask>,
    #[prost(message, optional, tag = "4")]
    pub current_document: Option<Precondition>,
}

pub mod write {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Operation {
        #[prost(message, tag = "1")]
        Update(super::Document),
        /// Document name to delete.
        #[prost(string, tag = "2")]
        Delete(String),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteRequest {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(string, tag = "2")]
    pub stream_id: String,
    #[prost(message, repeated, tag = "3")]
    pub writes: Vec<Write>,
    #[prost(bytes = "bytes", tag = "4")]
    pub stream_token: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteResponse {
    #[prost(string, tag = "1")]
    pub stream_id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub stream_token: Bytes,
    #[prost(message, repeated, tag = "3")]
    pub write_results: Vec<WriteResult>,
    #[prost(message, optional, tag = "4")]
    pub commit_time: Option<Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteResult {
    #[prost(message, optional, tag = "1")]
    pub update_time: Option<Timestamp>,
    #[prost(message, repeated, tag = "2")]
    pub transform_results: Vec<Value>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CommitRequest {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(message, repeated, tag = "2")]
    pub writes: Vec<Write>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CommitResponse {
    #[prost(message, repeated, tag = "1")]
    pub write_results: Vec<WriteResult>,
    #[prost(message, optional, tag = "2")]
    pub commit_time: Option<Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BatchGetDocumentsRequest {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(string, repeated, tag = "2")]
    pub documents: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BatchGetDocumentsResponse {
    #[prost(oneof = "batch_get_documents_response::Result", tags = "1, 2")]
    pub result: Option<batch_get_documents_response::Result>,
    #[prost(bytes = "bytes", tag = "3")]
    pub transaction: Bytes,
    #[prost(message, optional, tag = "4")]
    pub read_time: Option<Timestamp>,
}

pub mod batch_get_documents_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Found(super::Document),
        /// Name of a document that does not exist.
        #[prost(string, tag = "2")]
        Missing(String),
    }
}
