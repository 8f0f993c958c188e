//! Boundary checks applied before requests reach the relay core.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Rejected input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Message content was empty.
    #[error("content cannot be empty")]
    EmptyContent,
    /// Message content exceeded the byte limit.
    #[error("content exceeds maximum length of {max} bytes")]
    ContentTooLong {
        /// Configured maximum.
        max: usize,
    },
    /// Identifier was not a UUID.
    #[error("invalid conversation ID format")]
    InvalidConversationId,
    /// Tenant identifier was empty, too long, or not usable as a subject token.
    #[error("invalid tenant ID: {0}")]
    InvalidTenantId(&'static str),
    /// Title exceeded the character limit.
    #[error("title exceeds maximum length of {max} characters")]
    TitleTooLong {
        /// Configured maximum.
        max: usize,
    },
    /// Pagination parameter out of range.
    #[error("invalid pagination parameter: {0}")]
    InvalidPagination(&'static str),
    /// Page size outside the configured range.
    #[error("invalid pagination parameter: limit must be between 1 and {max}")]
    PageSizeOutOfRange {
        /// Configured maximum.
        max: usize,
    },
}

/// Size and paging limits enforced at the request boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Limits {
    /// Maximum message size in bytes.
    pub max_content_bytes: usize,
    /// Maximum title length in characters.
    pub max_title_chars: usize,
    /// Maximum tenant identifier length in bytes.
    pub max_tenant_id_len: usize,
    /// Message page size when the caller gives none.
    pub default_page_size: usize,
    /// Largest message page a caller may request.
    pub max_page_size: usize,
    /// Conversation page size when the caller gives none.
    pub default_conversation_page: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_content_bytes: 100_000,
            max_title_chars: 256,
            max_tenant_id_len: 64,
            default_page_size: 50,
            max_page_size: 100,
            default_conversation_page: 20,
        }
    }
}

impl Limits {
    /// Checks message content.
    ///
    /// # Errors
    /// Returns [`ValidationError::EmptyContent`] or
    /// [`ValidationError::ContentTooLong`].
    pub fn validate_content(&self, content: &str) -> Result<(), ValidationError> {
        if content.is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        if content.len() > self.max_content_bytes {
            return Err(ValidationError::ContentTooLong {
                max: self.max_content_bytes,
            });
        }
        Ok(())
    }

    /// Checks a conversation title.
    ///
    /// # Errors
    /// Returns [`ValidationError::TitleTooLong`].
    pub fn validate_title(&self, title: &str) -> Result<(), ValidationError> {
        if title.chars().count() > self.max_title_chars {
            return Err(ValidationError::TitleTooLong {
                max: self.max_title_chars,
            });
        }
        Ok(())
    }

    /// Checks a tenant identifier, which also becomes a log subject token.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidTenantId`].
    pub fn validate_tenant_id(&self, tenant_id: &str) -> Result<(), ValidationError> {
        if tenant_id.is_empty() {
            return Err(ValidationError::InvalidTenantId("cannot be empty"));
        }
        if tenant_id.len() > self.max_tenant_id_len {
            return Err(ValidationError::InvalidTenantId("exceeds maximum length"));
        }
        if !is_subject_token(tenant_id) {
            return Err(ValidationError::InvalidTenantId(
                "contains reserved subject characters",
            ));
        }
        Ok(())
    }

    /// Resolves a requested message page size: absent means the default,
    /// anything above the maximum is clamped.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidPagination`] for a zero limit.
    pub fn message_page(&self, requested: Option<usize>) -> Result<usize, ValidationError> {
        match requested {
            None => Ok(self.default_page_size),
            Some(0) => Err(ValidationError::InvalidPagination("limit must be positive")),
            Some(limit) => Ok(limit.min(self.max_page_size)),
        }
    }

    /// Resolves a requested conversation page size.
    ///
    /// # Errors
    /// Returns [`ValidationError::PageSizeOutOfRange`] when outside `1..=max_page_size`.
    pub fn conversation_page(&self, requested: Option<usize>) -> Result<usize, ValidationError> {
        match requested {
            None => Ok(self.default_conversation_page),
            Some(limit) if (1..=self.max_page_size).contains(&limit) => Ok(limit),
            Some(_) => Err(ValidationError::PageSizeOutOfRange {
                max: self.max_page_size,
            }),
        }
    }
}

/// Parses a conversation identifier.
///
/// # Errors
/// Returns [`ValidationError::InvalidConversationId`] when the value is not a UUID.
pub fn parse_conversation_id(raw: &str) -> Result<Uuid, ValidationError> {
    Uuid::parse_str(raw).map_err(|_| ValidationError::InvalidConversationId)
}

/// Whether `value` can be embedded as one token of a log subject.
#[must_use]
pub fn is_subject_token(value: &str) -> bool {
    !value.is_empty()
        && !value
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_limits_are_byte_based() {
        let limits = Limits {
            max_content_bytes: 4,
            ..Limits::default()
        };
        assert_eq!(limits.validate_content(""), Err(ValidationError::EmptyContent));
        assert!(limits.validate_content("abcd").is_ok());
        // Two 2-byte characters plus one more byte.
        assert_eq!(
            limits.validate_content("ééa"),
            Err(ValidationError::ContentTooLong { max: 4 })
        );
    }

    #[test]
    fn title_limit_counts_characters() {
        let limits = Limits::default();
        assert!(limits.validate_title(&"é".repeat(256)).is_ok());
        assert!(limits.validate_title(&"a".repeat(257)).is_err());
    }

    #[test]
    fn tenant_ids_reject_subject_wildcards() {
        let limits = Limits::default();
        assert!(limits.validate_tenant_id("tenant-1").is_ok());
        assert!(limits.validate_tenant_id("").is_err());
        assert!(limits.validate_tenant_id("a.b").is_err());
        assert!(limits.validate_tenant_id("a>").is_err());
        assert!(limits.validate_tenant_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn message_page_defaults_and_clamps() {
        let limits = Limits::default();
        assert_eq!(limits.message_page(None).unwrap(), 50);
        assert_eq!(limits.message_page(Some(500)).unwrap(), 100);
        assert!(limits.message_page(Some(0)).is_err());
    }

    #[test]
    fn conversation_page_rejects_out_of_range() {
        let limits = Limits::default();
        assert_eq!(limits.conversation_page(None).unwrap(), 20);
        assert_eq!(limits.conversation_page(Some(100)).unwrap(), 100);
        assert!(limits.conversation_page(Some(101)).is_err());
        assert!(limits.conversation_page(Some(0)).is_err());
    }

    #[test]
    fn page_range_error_names_the_configured_bound() {
        let limits = Limits {
            max_page_size: 25,
            ..Limits::default()
        };
        let err = limits.conversation_page(Some(26)).unwrap_err();
        assert_eq!(err, ValidationError::PageSizeOutOfRange { max: 25 });
        assert_eq!(
            err.to_string(),
            "invalid pagination parameter: limit must be between 1 and 25"
        );
    }

    #[test]
    fn conversation_ids_must_be_uuids() {
        assert!(parse_conversation_id("not-a-uuid").is_err());
        let id = Uuid::now_v7();
        assert_eq!(parse_conversation_id(&id.to_string()).unwrap(), id);
    }
}
