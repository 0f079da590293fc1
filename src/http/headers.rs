//! Case-insensitive HTTP header multimap.

/// Ordered header collection with case-insensitive names.
///
/// Two insertion policies exist, matching the two sides of a
/// transaction:
///
/// - [`insert`](Self::insert) (response parsing): a later value replaces
///   an earlier one for the same name, **except** `Set-Cookie`, which
///   accumulates.
/// - [`add`](Self::add) (request building): `force` controls overwrite
///   vs keep-existing, so generated defaults never clobber what the
///   caller set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response-side insertion: replace on repeat, accumulate `Set-Cookie`.
    pub fn insert(&mut self, name: &str, value: &str) {
        if !name.eq_ignore_ascii_case("set-cookie") {
            if let Some(entry) = self
                .entries
                .iter_mut()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
            {
                entry.1 = value.to_string();
                return;
            }
        }
        self.entries.push((name.to_string(), value.to_string()));
    }

    /// Request-side insertion. `force` overwrites an existing value;
    /// otherwise an existing value wins.
    pub fn add(&mut self, name: &str, value: &str, force: bool) -> &mut Self {
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(entry) if force => entry.1 = value.to_string(),
            Some(_) => {}
            None => self.entries.push((name.to_string(), value.to_string())),
        }
        self
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name` (relevant for `Set-Cookie`).
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
