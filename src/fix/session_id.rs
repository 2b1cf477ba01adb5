//! Session identity.

use crate::fix::fields::FixVersion;
use std::fmt;

/// The sentinel FIX uses for "component not set".
pub const NOT_APPLICABLE: &str = "N/A";

/// The tuple that names a session: BeginString plus the comp ID pair, with
/// optional sub/location components and a local qualifier to distinguish
/// otherwise-identical sessions. Equality over the full tuple is the key of
/// the session registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId {
    begin_string: String,
    sender_comp_id: String,
    target_comp_id: String,
    sender_sub_id: Option<String>,
    sender_location_id: Option<String>,
    target_sub_id: Option<String>,
    target_location_id: Option<String>,
    qualifier: Option<String>,
}

impl SessionId {
    pub fn new(begin_string: &str, sender_comp_id: &str, target_comp_id: &str) -> SessionId {
        SessionId {
            begin_string: begin_string.to_owned(),
            sender_comp_id: sender_comp_id.to_owned(),
            target_comp_id: target_comp_id.to_owned(),
            sender_sub_id: None,
            sender_location_id: None,
            target_sub_id: None,
            target_location_id: None,
            qualifier: None,
        }
    }

    pub fn builder(
        begin_string: &str,
        sender_comp_id: &str,
        target_comp_id: &str,
    ) -> SessionIdBuilder {
        SessionIdBuilder {
            inner: SessionId::new(begin_string, sender_comp_id, target_comp_id),
        }
    }

    /// The same conversation as seen from the peer's side.
    pub fn reverse_route(mut self) -> SessionId {
        std::mem::swap(&mut self.sender_comp_id, &mut self.target_comp_id);
        std::mem::swap(&mut self.sender_sub_id, &mut self.target_sub_id);
        std::mem::swap(&mut self.sender_location_id, &mut self.target_location_id);
        self
    }

    pub fn begin_string(&self) -> &str {
        &self.begin_string
    }

    pub fn sender_comp_id(&self) -> &str {
        &self.sender_comp_id
    }

    pub fn target_comp_id(&self) -> &str {
        &self.target_comp_id
    }

    pub fn sender_sub_id(&self) -> Option<&str> {
        self.sender_sub_id.as_deref()
    }

    pub fn sender_location_id(&self) -> Option<&str> {
        self.sender_location_id.as_deref()
    }

    pub fn target_sub_id(&self) -> Option<&str> {
        self.target_sub_id.as_deref()
    }

    pub fn target_location_id(&self) -> Option<&str> {
        self.target_location_id.as_deref()
    }

    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }

    pub fn fix_version(&self) -> Result<FixVersion, String> {
        FixVersion::try_from(self.begin_string.as_str())
    }

    pub fn is_fixt(&self) -> bool {
        self.begin_string.starts_with("FIXT")
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}",
            self.begin_string, self.sender_comp_id, self.target_comp_id
        )?;
        if let Some(qualifier) = &self.qualifier {
            write!(f, ":{qualifier}")?;
        }
        Ok(())
    }
}

pub struct SessionIdBuilder {
    inner: SessionId,
}

fn component(value: &str) -> Option<String> {
    if value.is_empty() || value == NOT_APPLICABLE {
        None
    } else {
        Some(value.to_owned())
    }
}

impl SessionIdBuilder {
    pub fn sender_sub_id(mut self, value: &str) -> Self {
        self.inner.sender_sub_id = component(value);
        self
    }

    pub fn sender_location_id(mut self, value: &str) -> Self {
        self.inner.sender_location_id = component(value);
        self
    }

    pub fn target_sub_id(mut self, value: &str) -> Self {
        self.inner.target_sub_id = component(value);
        self
    }

    pub fn target_location_id(mut self, value: &str) -> Self {
        self.inner.target_location_id = component(value);
        self
    }

    pub fn qualifier(mut self, value: &str) -> Self {
        self.inner.qualifier = component(value);
        self
    }

    pub fn build(self) -> SessionId {
        self.inner
    }
}
