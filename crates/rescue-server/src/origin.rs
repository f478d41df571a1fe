use rescue_core::RelayError;

/// Exact-match allow-list for the `Origin` header of WebSocket upgrades.
#[derive(Clone, Debug)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: Vec<String> = Vec::new();
        for origin in allowed {
            let origin = origin.into();
            let origin = origin.trim();
            if !origin.is_empty() && !list.iter().any(|o| o == origin) {
                list.push(origin.to_string());
            }
        }
        Self { allowed: list }
    }

    /// A missing header is never admitted.
    pub fn admit(&self, origin: Option<&str>) -> Result<(), RelayError> {
        match origin {
            Some(origin) if self.allowed.iter().any(|o| o == origin) => Ok(()),
            _ => Err(RelayError::OriginRejected {
                origin: origin.map(str::to_string),
            }),
        }
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }
}
