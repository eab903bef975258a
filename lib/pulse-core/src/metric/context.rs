use std::{collections::BTreeSet, fmt};

/// Identity of a metric.
///
/// Two metrics share a context when they have the same name, the same set of tags (order and duplicates are
/// irrelevant), the same hostname, and the same device name. Tags are stored sorted and deduplicated so that equality
/// and hashing only depend on the tag set.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Context {
    name: String,
    tags: Vec<String>,
    hostname: String,
    device_name: String,
}

impl Context {
    /// Creates a new `Context`.
    pub fn new<N, I, T, H, D>(name: N, tags: I, hostname: H, device_name: D) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<String>,
        H: Into<String>,
        D: Into<String>,
    {
        let tags = tags.into_iter().map(Into::into).collect::<BTreeSet<String>>();

        Self {
            name: name.into(),
            tags: tags.into_iter().collect(),
            hostname: hostname.into(),
            device_name: device_name.into(),
        }
    }

    /// Returns the metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the sorted, deduplicated tags.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Returns the hostname.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns the device name.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.tags.is_empty() {
            write!(f, "{{{}}}", self.tags.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash as _, Hasher as _};

    use super::*;

    fn hash_of(context: &Context) -> u64 {
        let mut hasher = DefaultHasher::new();
        context.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn tag_order_and_duplicates_ignored() {
        let a = Context::new("disk.used", ["a", "b"], "web-01", "sda");
        let b = Context::new("disk.used", ["b", "a", "a"], "web-01", "sda");

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a.tags(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn hostname_and_device_distinguish() {
        let base = Context::new("disk.used", ["a"], "web-01", "sda");

        assert_ne!(base, Context::new("disk.used", ["a"], "web-02", "sda"));
        assert_ne!(base, Context::new("disk.used", ["a"], "web-01", "sdb"));
        assert_ne!(base, Context::new("disk.free", ["a"], "web-01", "sda"));
    }

    #[test]
    fn display() {
        let context = Context::new("requests", ["env:prod", "az:1"], "", "");
        assert_eq!(context.to_string(), "requests{az:1,env:prod}");
    }
}
