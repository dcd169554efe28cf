//! Blanket-ish [`HasDependencies`] impls for plain data types.

use crate::{Dependencies, HasDependencies};

macro_rules! no_deps {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl HasDependencies for $ty {}
        )+
    }
}

no_deps! {
    (),
    bool,
    char,
    f32,
    f64,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    String,
    std::path::PathBuf,
    serde_json::Value,
}

impl<T: HasDependencies> HasDependencies for Option<T> {
    fn dependencies(&self) -> Dependencies {
        self.as_ref()
            .map(HasDependencies::dependencies)
            .unwrap_or_default()
    }
}

impl<T: HasDependencies> HasDependencies for Vec<T> {
    fn dependencies(&self) -> Dependencies {
        self.iter()
            .fold(Dependencies::default(), |deps, t| {
                deps.merge(t.dependencies())
            })
    }
}

impl<K, V: HasDependencies> HasDependencies for std::collections::HashMap<K, V> {
    fn dependencies(&self) -> Dependencies {
        self.values().fold(Dependencies::default(), |deps, v| {
            deps.merge(v.dependencies())
        })
    }
}

impl<K, V: HasDependencies> HasDependencies for std::collections::BTreeMap<K, V> {
    fn dependencies(&self) -> Dependencies {
        self.values().fold(Dependencies::default(), |deps, v| {
            deps.merge(v.dependencies())
        })
    }
}

impl<T: HasDependencies> HasDependencies for std::collections::HashSet<T> {
    fn dependencies(&self) -> Dependencies {
        self.iter().fold(Dependencies::default(), |deps, t| {
            deps.merge(t.dependencies())
        })
    }
}

impl<T: HasDependencies> HasDependencies for std::collections::BTreeSet<T> {
    fn dependencies(&self) -> Dependencies {
        self.iter().fold(Dependencies::default(), |deps, t| {
            deps.merge(t.dependencies())
        })
    }
}
