use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use crate::codec::field_infos::FieldInfos;
use crate::directory::{Directory, IndexInput};
use crate::error::{SearchError, SearchResult};

const MAGIC: &[u8; 3] = b"NRM";
const VERSION: u8 = 1;

/// Writes the `.nrm` file: magic, version, then one byte per document for
/// every field that carries norms, in field-number order.
pub fn write_norms(
    dir: &dyn Directory,
    name: &str,
    field_infos: &FieldInfos,
    norms: &HashMap<u32, Vec<u8>>,
    max_doc: u32,
) -> SearchResult<()> {
    let mut out = dir.create_output(name)?;
    out.write_bytes(MAGIC)?;
    out.write_byte(VERSION)?;
    for info in field_infos.iter() {
        if !info.has_norms() {
            continue;
        }
        match norms.get(&info.number) {
            Some(bytes) => {
                debug_assert_eq!(bytes.len(), max_doc as usize);
                out.write_bytes(bytes)?;
            }
            None => {
                // field seen in the schema but absent from every buffered
                // doc: neutral norms
                let neutral = crate::search::similarity::encode_norm(1.0);
                out.write_bytes(&vec![neutral; max_doc as usize])?;
            }
        }
    }
    out.close()
}

/// Lazily materializes per-field norm arrays from a `.nrm` input.
pub struct NormsReader {
    input: IndexInput,
    offsets: HashMap<u32, u64>,
    max_doc: u32,
    cache: Mutex<HashMap<u32, Arc<Vec<u8>>>>,
}

impl NormsReader {
    pub fn open(
        mut input: IndexInput,
        field_infos: &FieldInfos,
        max_doc: u32,
    ) -> SearchResult<Self> {
        let mut magic = [0u8; 3];
        input.read_bytes(&mut magic)?;
        let version = input.read_byte()?;
        if &magic != MAGIC || version != VERSION {
            return Err(SearchError::corrupt(format!(
                "bad norms header in {}",
                input.name()
            )));
        }
        let mut offsets = HashMap::new();
        let mut offset = 4u64;
        for info in field_infos.iter() {
            if info.has_norms() {
                offsets.insert(info.number, offset);
                offset += max_doc as u64;
            }
        }
        if offset != input.len() {
            return Err(SearchError::corrupt(format!(
                "norms file {} has length {}, expected {offset}",
                input.name(),
                input.len()
            )));
        }
        Ok(Self {
            input,
            offsets,
            max_doc,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Norm bytes for one field, or `None` if the field has no norms.
    pub fn norms(&self, field: u32) -> SearchResult<Option<Arc<Vec<u8>>>> {
        let offset = match self.offsets.get(&field) {
            Some(&offset) => offset,
            None => return Ok(None),
        };
        let mut cache = self.cache.lock().unwrap();
        if let Some(bytes) = cache.get(&field) {
            return Ok(Some(Arc::clone(bytes)));
        }
        let mut input = self.input.clone();
        input.seek(offset)?;
        let bytes = Arc::new(input.read_vec(self.max_doc as usize)?);
        cache.insert(field, Arc::clone(&bytes));
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RamDirectory;
    use crate::document::FieldOptions;

    #[test]
    fn norms_round_trip() {
        let dir = RamDirectory::new();
        let mut infos = FieldInfos::new();
        let indexed = FieldOptions {
            indexed: true,
            tokenized: true,
            ..Default::default()
        };
        let no_norms = FieldOptions {
            indexed: true,
            omit_norms: true,
            ..Default::default()
        };
        let body = infos.add("body", &indexed);
        let id = infos.add("id", &no_norms);
        let title = infos.add("title", &indexed);

        let mut norms = HashMap::new();
        norms.insert(body, vec![1u8, 2, 3]);
        norms.insert(title, vec![4u8, 5, 6]);
        write_norms(dir.as_ref(), "_0.nrm", &infos, &norms, 3).unwrap();

        let input = dir.open_input("_0.nrm").unwrap();
        let reader = NormsReader::open(input, &infos, 3).unwrap();
        assert_eq!(reader.norms(body).unwrap().unwrap().as_slice(), &[1, 2, 3]);
        assert_eq!(reader.norms(title).unwrap().unwrap().as_slice(), &[4, 5, 6]);
        assert!(reader.norms(id).unwrap().is_none());
    }
}
