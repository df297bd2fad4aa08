//! Function id ↔ name table
//!
//! The recorder never interprets function ids; the interception layer owns the
//! list of wrapped calls and hands it over so the names can be stored in the
//! session metadata for offline readers.

use serde::{Deserialize, Serialize};

/// Library layer a traced call belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CallCategory {
    Posix = 0,
    MpiIo = 1,
    Mpi = 2,
    Hdf5 = 3,
    Ftrace = 4,
    PnetCdf = 5,
    NetCdf = 6,
    User = 255,
}

/// Which categories were captured during a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFlags {
    pub posix: bool,
    pub mpi: bool,
    pub mpiio: bool,
    pub hdf5: bool,
    pub pnetcdf: bool,
    pub netcdf: bool,
}

impl CategoryFlags {
    pub fn enable(&mut self, category: CallCategory) {
        match category {
            CallCategory::Posix => self.posix = true,
            CallCategory::Mpi => self.mpi = true,
            CallCategory::MpiIo => self.mpiio = true,
            CallCategory::Hdf5 => self.hdf5 = true,
            CallCategory::PnetCdf => self.pnetcdf = true,
            CallCategory::NetCdf => self.netcdf = true,
            CallCategory::Ftrace | CallCategory::User => {}
        }
    }
}

/// Dense table of traced function names, indexed by function id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionTable {
    names: Vec<String>,
    categories: CategoryFlags,
}

impl FunctionTable {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            categories: CategoryFlags::default(),
        }
    }

    pub fn with_categories(mut self, categories: &[CallCategory]) -> Self {
        for c in categories {
            self.categories.enable(*c);
        }
        self
    }

    /// Append a name, returning its function id
    pub fn register(&mut self, name: impl Into<String>) -> i32 {
        self.names.push(name.into());
        (self.names.len() - 1) as i32
    }

    pub fn name(&self, func_id: i32) -> Option<&str> {
        usize::try_from(func_id)
            .ok()
            .and_then(|i| self.names.get(i))
            .map(String::as_str)
    }

    pub fn id_of(&self, name: &str) -> Option<i32> {
        self.names.iter().position(|n| n == name).map(|i| i as i32)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn categories(&self) -> CategoryFlags {
        self.categories
    }

    pub fn set_categories(&mut self, categories: CategoryFlags) {
        self.categories = categories;
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut table = FunctionTable::new(["open", "write"]);
        let close = table.register("close");

        assert_eq!(close, 2);
        assert_eq!(table.name(1), Some("write"));
        assert_eq!(table.id_of("close"), Some(2));
        assert_eq!(table.name(-1), None);
        assert_eq!(table.name(3), None);
    }

    #[test]
    fn test_categories() {
        let table = FunctionTable::new(["MPI_File_open"])
            .with_categories(&[CallCategory::MpiIo, CallCategory::User]);

        let flags = table.categories();
        assert!(flags.mpiio);
        assert!(!flags.posix);
    }
}
