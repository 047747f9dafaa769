//! Mapping between [`Message`] and remote documents.
//!
//! Both the engine and the reference document store agree on these field
//! names. A message document is created once by the author with status
//! `sent`; afterwards only the counterpart mutates its `status` and the
//! matching `<status>_at` timestamp.

use crate::document::{FieldValue, Fields};
use crate::message::{
    ConversationId, DeliveryStatus, MediaRef, Message, MessageBody, MessageId, SenderId,
    Timestamp, ValidationError,
};

/// Local message id, shared by every device.
pub const LOCAL_ID: &str = "local_id";
/// Owning conversation.
pub const CONVERSATION_ID: &str = "conversation_id";
/// Author account id.
pub const SENDER_ID: &str = "sender_id";
/// `"text"` or `"media"`.
pub const BODY_KIND: &str = "body_kind";
/// Inline text for text bodies.
pub const TEXT: &str = "text";
/// MIME type for media bodies.
pub const MEDIA_MIME: &str = "media_mime";
/// URL for media bodies.
pub const MEDIA_URL: &str = "media_url";
/// Byte size for media bodies.
pub const MEDIA_SIZE: &str = "media_size";
/// Client creation time.
pub const CREATED_AT: &str = "created_at";
/// Delivery status name.
pub const STATUS: &str = "status";
/// Time the counterpart received the message.
pub const DELIVERED_AT: &str = "delivered_at";
/// Time the counterpart read the message.
pub const READ_AT: &str = "read_at";

/// Errors raised when a document does not describe a valid message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// A required field is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// A field holds a value of the wrong type or format.
    #[error("invalid value for field `{0}`")]
    InvalidField(&'static str),
    /// The message body is malformed.
    #[error("invalid body: {0}")]
    InvalidBody(#[from] ValidationError),
}

/// A message as read back from a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    /// Local id the author assigned.
    pub local_id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: SenderId,
    /// Content.
    pub body: MessageBody,
    /// Author's creation time.
    pub created_at: Timestamp,
    /// Status recorded in the document.
    pub status: DeliveryStatus,
    /// Receipt time, if recorded.
    pub delivered_at: Option<Timestamp>,
    /// Read time, if recorded.
    pub read_at: Option<Timestamp>,
}

/// Fields written when a message is first stored remotely.
#[must_use]
pub fn message_fields(message: &Message) -> Fields {
    let mut fields = Fields::new();
    fields.insert(LOCAL_ID.into(), message.id.to_string().into());
    fields.insert(
        CONVERSATION_ID.into(),
        message.conversation_id.to_string().into(),
    );
    fields.insert(SENDER_ID.into(), message.sender_id.as_str().into());
    fields.insert(CREATED_AT.into(), message.created_at.into());
    fields.insert(STATUS.into(), DeliveryStatus::Sent.as_str().into());
    match &message.body {
        MessageBody::Text(text) => {
            fields.insert(BODY_KIND.into(), "text".into());
            fields.insert(TEXT.into(), text.as_str().into());
        }
        MessageBody::Media(media) => {
            fields.insert(BODY_KIND.into(), "media".into());
            fields.insert(MEDIA_MIME.into(), media.mime.as_str().into());
            fields.insert(MEDIA_URL.into(), media.url.as_str().into());
            fields.insert(
                MEDIA_SIZE.into(),
                FieldValue::Int(i64::try_from(media.size_bytes).unwrap_or(i64::MAX)),
            );
        }
    }
    fields
}

/// Fields written when the counterpart advances a message to `status`.
#[must_use]
pub fn status_fields(status: DeliveryStatus, at: Timestamp) -> Fields {
    let mut fields = Fields::new();
    fields.insert(STATUS.into(), status.as_str().into());
    match status {
        DeliveryStatus::Delivered => {
            fields.insert(DELIVERED_AT.into(), at.into());
        }
        DeliveryStatus::Read => {
            fields.insert(READ_AT.into(), at.into());
        }
        _ => {}
    }
    fields
}

/// Whether the document carries a message body.
#[must_use]
pub fn has_body(fields: &Fields) -> bool {
    fields.contains_key(BODY_KIND)
}

/// Reads the message body out of a document.
///
/// # Errors
///
/// Returns [`SchemaError`] if body fields are missing or of the wrong type.
pub fn parse_body(fields: &Fields) -> Result<MessageBody, SchemaError> {
    match text_field(fields, BODY_KIND)? {
        "text" => Ok(MessageBody::Text(text_field(fields, TEXT)?.to_string())),
        "media" => {
            let size = fields
                .get(MEDIA_SIZE)
                .and_then(FieldValue::as_int)
                .and_then(|n| u64::try_from(n).ok())
                .ok_or(SchemaError::InvalidField(MEDIA_SIZE))?;
            Ok(MessageBody::Media(MediaRef {
                mime: text_field(fields, MEDIA_MIME)?.to_string(),
                url: text_field(fields, MEDIA_URL)?.to_string(),
                size_bytes: size,
            }))
        }
        _ => Err(SchemaError::InvalidField(BODY_KIND)),
    }
}

/// Reads a whole message out of a document.
///
/// # Errors
///
/// Returns [`SchemaError`] if a required field is missing or malformed.
pub fn parse_message(fields: &Fields) -> Result<RemoteMessage, SchemaError> {
    let local_id =
        MessageId::parse(text_field(fields, LOCAL_ID)?).ok_or(SchemaError::InvalidField(LOCAL_ID))?;
    let conversation_id = ConversationId::parse(text_field(fields, CONVERSATION_ID)?)
        .ok_or(SchemaError::InvalidField(CONVERSATION_ID))?;
    let status = DeliveryStatus::parse(text_field(fields, STATUS)?)
        .ok_or(SchemaError::InvalidField(STATUS))?;
    let created_at = fields
        .get(CREATED_AT)
        .ok_or(SchemaError::MissingField(CREATED_AT))?
        .as_timestamp()
        .ok_or(SchemaError::InvalidField(CREATED_AT))?;

    Ok(RemoteMessage {
        local_id,
        conversation_id,
        sender_id: SenderId::new(text_field(fields, SENDER_ID)?),
        body: parse_body(fields)?,
        created_at,
        status,
        delivered_at: fields.get(DELIVERED_AT).and_then(FieldValue::as_timestamp),
        read_at: fields.get(READ_AT).and_then(FieldValue::as_timestamp),
    })
}

/// Checks that a document's body would be accepted for sending.
///
/// Documents without a body (status-only updates) pass.
///
/// # Errors
///
/// Returns [`SchemaError`] for a malformed or invalid body.
pub fn validate_document(fields: &Fields) -> Result<(), SchemaError> {
    if !has_body(fields) {
        return Ok(());
    }
    parse_body(fields)?.validate()?;
    Ok(())
}

fn text_field<'a>(fields: &'a Fields, name: &'static str) -> Result<&'a str, SchemaError> {
    fields
        .get(name)
        .ok_or(SchemaError::MissingField(name))?
        .as_text()
        .ok_or(SchemaError::InvalidField(name))
}
