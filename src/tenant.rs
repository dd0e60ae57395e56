use uuid::Uuid;

/// Per-call identity supplied by the embedding transport layer.
///
/// The queue core never authenticates anyone; it only carries whatever
/// identity the surrounding application resolved for the call.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub subject: Option<String>,
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl Caller {
    /// A caller with no identity; management calls run unscoped.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            claims: serde_json::Map::new(),
        }
    }
}

/// Maps a caller's identity to the tenant that owns their jobs.
///
/// When a resolver is configured it is authoritative for every management
/// call; returning `None` leaves the call unscoped. Rejecting
/// unauthenticated callers is the embedding application's concern.
pub trait TenantResolver: Send + Sync {
    fn resolve(&self, caller: &Caller) -> Option<Uuid>;
}

impl<F> TenantResolver for F
where
    F: Fn(&Caller) -> Option<Uuid> + Send + Sync,
{
    fn resolve(&self, caller: &Caller) -> Option<Uuid> {
        self(caller)
    }
}

/// Resolver that treats the caller's subject as the owning tenant id.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubjectResolver;

impl TenantResolver for SubjectResolver {
    fn resolve(&self, caller: &Caller) -> Option<Uuid> {
        caller
            .subject
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_resolver_parses_uuid_subjects() {
        let id = Uuid::new_v4();
        let caller = Caller::with_subject(id.to_string());
        assert_eq!(SubjectResolver.resolve(&caller), Some(id));

        assert_eq!(SubjectResolver.resolve(&Caller::anonymous()), None);
        assert_eq!(
            SubjectResolver.resolve(&Caller::with_subject("not-a-uuid")),
            None
        );
    }

    #[test]
    fn closures_are_resolvers() {
        let fixed = Uuid::new_v4();
        let resolver = move |_caller: &Caller| Some(fixed);
        assert_eq!(resolver.resolve(&Caller::anonymous()), Some(fixed));
    }
}
