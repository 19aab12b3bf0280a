use ulid::Ulid;

/// Who is invoking an engine operation. The request layer authenticates and
/// builds this; the engine decides what each role may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Admin,
    Customer(Ulid),
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        matches!(self, Caller::Admin)
    }

    pub fn customer_id(&self) -> Option<Ulid> {
        match self {
            Caller::Customer(id) => Some(*id),
            Caller::Admin => None,
        }
    }
}

/// Allow-list of credentials accepted by the payment webhook.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    keys: Vec<String>,
}

impl ApiKeys {
    /// Parse a comma separated list. Blank entries are ignored.
    pub fn parse(list: &str) -> Self {
        let keys = list
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_owned)
            .collect();
        Self { keys }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn accepts(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}
