use std::sync::Arc;

use hashbrown::HashMap;

use crate::directory::{Directory, IndexInput};
use crate::document::FieldOptions;
use crate::error::{SearchError, SearchResult};

const FORMAT: i32 = -1;

const IS_INDEXED: u8 = 0x01;
const STORE_TERM_VECTOR: u8 = 0x02;
const VECTOR_POSITIONS: u8 = 0x04;
const VECTOR_OFFSETS: u8 = 0x08;
const OMIT_NORMS: u8 = 0x10;
const STORE_PAYLOADS: u8 = 0x20;
const OMIT_TERM_FREQ_AND_POSITIONS: u8 = 0x40;

/// Per-field schema discovered during indexing. The number is stable for
/// the life of the segment; flags are the union of everything observed.
#[derive(Clone, Debug)]
pub struct FieldInfo {
    pub name: String,
    pub number: u32,
    pub is_indexed: bool,
    pub store_term_vector: bool,
    pub vector_positions: bool,
    pub vector_offsets: bool,
    pub omit_norms: bool,
    pub store_payloads: bool,
    pub omit_term_freq_and_positions: bool,
}

impl FieldInfo {
    fn flags(&self) -> u8 {
        let mut bits = 0;
        if self.is_indexed {
            bits |= IS_INDEXED;
        }
        if self.store_term_vector {
            bits |= STORE_TERM_VECTOR;
        }
        if self.vector_positions {
            bits |= VECTOR_POSITIONS;
        }
        if self.vector_offsets {
            bits |= VECTOR_OFFSETS;
        }
        if self.omit_norms {
            bits |= OMIT_NORMS;
        }
        if self.store_payloads {
            bits |= STORE_PAYLOADS;
        }
        if self.omit_term_freq_and_positions {
            bits |= OMIT_TERM_FREQ_AND_POSITIONS;
        }
        bits
    }

    pub fn has_norms(&self) -> bool {
        self.is_indexed && !self.omit_norms
    }
}

/// The field table of one segment, written as `.fnm`. Field numbers are
/// implicit from position in the file.
#[derive(Clone, Debug, Default)]
pub struct FieldInfos {
    infos: Vec<FieldInfo>,
    by_name: HashMap<String, u32>,
}

impl FieldInfos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a field occurrence, assigning a number on first sight and
    /// widening the flags on every later one.
    pub fn add(&mut self, name: &str, options: &FieldOptions) -> u32 {
        if let Some(&number) = self.by_name.get(name) {
            let info = &mut self.infos[number as usize];
            info.is_indexed |= options.indexed;
            info.store_term_vector |= options.store_term_vector;
            info.vector_positions |= options.vector_positions;
            info.vector_offsets |= options.vector_offsets;
            // omissions only hold if every occurrence omits
            info.omit_norms &= options.omit_norms || !options.indexed;
            info.omit_term_freq_and_positions &=
                options.omit_term_freq_and_positions || !options.indexed;
            return number;
        }
        let number = self.infos.len() as u32;
        self.infos.push(FieldInfo {
            name: name.to_string(),
            number,
            is_indexed: options.indexed,
            store_term_vector: options.store_term_vector,
            vector_positions: options.vector_positions,
            vector_offsets: options.vector_offsets,
            omit_norms: options.omit_norms || !options.indexed,
            store_payloads: false,
            omit_term_freq_and_positions: options.omit_term_freq_and_positions || !options.indexed,
        });
        self.by_name.insert(name.to_string(), number);
        number
    }

    pub fn set_store_payloads(&mut self, number: u32) {
        self.infos[number as usize].store_payloads = true;
    }

    pub fn by_number(&self, number: u32) -> Option<&FieldInfo> {
        self.infos.get(number as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name
            .get(name)
            .and_then(|&n| self.infos.get(n as usize))
    }

    pub fn number_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, number: u32) -> Option<&str> {
        self.infos.get(number as usize).map(|i| i.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.infos.iter()
    }

    pub fn has_vectors(&self) -> bool {
        self.infos.iter().any(|i| i.store_term_vector)
    }

    /// True when at least one field carries norms, i.e. the segment has a
    /// `.nrm` file at all.
    pub fn has_norms(&self) -> bool {
        self.infos.iter().any(FieldInfo::has_norms)
    }

    pub fn write(&self, dir: &dyn Directory, name: &str) -> SearchResult<()> {
        let mut out = dir.create_output(name)?;
        out.write_i32(FORMAT)?;
        out.write_vint(self.infos.len() as u32)?;
        for info in &self.infos {
            out.write_string(&info.name)?;
            out.write_byte(info.flags())?;
        }
        out.close()
    }

    pub fn read(input: &mut IndexInput) -> SearchResult<Arc<Self>> {
        let format = input.read_i32()?;
        if format != FORMAT {
            return Err(SearchError::corrupt(format!(
                "unknown field infos format {format} in {}",
                input.name()
            )));
        }
        let count = input.read_vint()? as usize;
        let mut infos = Self::new();
        for number in 0..count {
            let name = input.read_string()?;
            let bits = input.read_byte()?;
            let number = number as u32;
            infos.infos.push(FieldInfo {
                name: name.clone(),
                number,
                is_indexed: bits & IS_INDEXED != 0,
                store_term_vector: bits & STORE_TERM_VECTOR != 0,
                vector_positions: bits & VECTOR_POSITIONS != 0,
                vector_offsets: bits & VECTOR_OFFSETS != 0,
                omit_norms: bits & OMIT_NORMS != 0,
                store_payloads: bits & STORE_PAYLOADS != 0,
                omit_term_freq_and_positions: bits & OMIT_TERM_FREQ_AND_POSITIONS != 0,
            });
            infos.by_name.insert(name, number);
        }
        Ok(Arc::new(infos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RamDirectory;

    #[test]
    fn flags_widen_across_occurrences() {
        let mut infos = FieldInfos::new();
        let stored_only = FieldOptions {
            stored: true,
            ..Default::default()
        };
        let indexed = FieldOptions {
            indexed: true,
            tokenized: true,
            ..Default::default()
        };
        let n1 = infos.add("body", &stored_only);
        let n2 = infos.add("body", &indexed);
        assert_eq!(n1, n2);
        let info = infos.by_name("body").unwrap();
        assert!(info.is_indexed);
        // a stored-only occurrence does not force norms on
        assert!(info.has_norms());
    }

    #[test]
    fn file_round_trip() {
        let dir = RamDirectory::new();
        let mut infos = FieldInfos::new();
        infos.add(
            "id",
            &FieldOptions {
                indexed: true,
                omit_norms: true,
                omit_term_freq_and_positions: true,
                ..Default::default()
            },
        );
        infos.add(
            "body",
            &FieldOptions {
                indexed: true,
                tokenized: true,
                store_term_vector: true,
                vector_positions: true,
                ..Default::default()
            },
        );
        infos.write(dir.as_ref(), "_0.fnm").unwrap();

        let mut input = dir.open_input("_0.fnm").unwrap();
        let read = FieldInfos::read(&mut input).unwrap();
        assert_eq!(read.len(), 2);
        let id = read.by_name("id").unwrap();
        assert!(id.omit_term_freq_and_positions && id.omit_norms);
        let body = read.by_name("body").unwrap();
        assert!(body.store_term_vector && body.vector_positions && !body.vector_offsets);
        assert_eq!(read.number_of("body"), Some(1));
    }
}
