use crate::directory::{IndexInput, IndexOutput, RamOutput};
use crate::error::SearchResult;
use crate::util::DocId;

/// Entries are buffered every `SKIP_INTERVAL` documents; level L holds one
/// entry per `SKIP_INTERVAL^(L+1)` documents, so `advance` descends only as
/// deep as the jump requires.
pub const SKIP_INTERVAL: u32 = 16;
pub const MAX_SKIP_LEVELS: usize = 10;

fn levels_for(doc_count: u32) -> usize {
    let mut levels = 1;
    let mut points = doc_count / SKIP_INTERVAL;
    while levels < MAX_SKIP_LEVELS && points >= SKIP_INTERVAL {
        levels += 1;
        points /= SKIP_INTERVAL;
    }
    levels
}

/// Buffers the skip pyramid for one term while its postings are written,
/// then appends it to the freq file after the last posting.
pub struct SkipListWriter {
    levels: Vec<RamOutput>,
    last_doc: Vec<DocId>,
    last_freq_ptr: Vec<u64>,
    last_prox_ptr: Vec<u64>,
}

impl SkipListWriter {
    pub fn new() -> Self {
        Self {
            levels: (0..MAX_SKIP_LEVELS).map(|_| RamOutput::new()).collect(),
            last_doc: vec![0; MAX_SKIP_LEVELS],
            last_freq_ptr: vec![0; MAX_SKIP_LEVELS],
            last_prox_ptr: vec![0; MAX_SKIP_LEVELS],
        }
    }

    pub fn reset(&mut self, freq_base: u64, prox_base: u64) {
        for level in &mut self.levels {
            level.reset();
        }
        self.last_doc.iter_mut().for_each(|d| *d = 0);
        self.last_freq_ptr.iter_mut().for_each(|p| *p = freq_base);
        self.last_prox_ptr.iter_mut().for_each(|p| *p = prox_base);
    }

    /// Records a skip point after `num_docs` documents (a multiple of the
    /// interval). `doc` is the last document written; the pointers address
    /// the entry that follows it.
    pub fn buffer_skip(
        &mut self,
        doc: DocId,
        num_docs: u32,
        freq_ptr: u64,
        prox_ptr: u64,
    ) -> SearchResult<()> {
        let mut point_levels = 1;
        let mut points = num_docs / SKIP_INTERVAL;
        while point_levels < MAX_SKIP_LEVELS && points % SKIP_INTERVAL == 0 {
            point_levels += 1;
            points /= SKIP_INTERVAL;
        }
        let mut child_pointer = 0;
        for level in 0..point_levels {
            let out = &mut self.levels[level];
            out.write_vint((doc - self.last_doc[level]) as u32)?;
            out.write_vlong(freq_ptr - self.last_freq_ptr[level])?;
            out.write_vlong(prox_ptr - self.last_prox_ptr[level])?;
            self.last_doc[level] = doc;
            self.last_freq_ptr[level] = freq_ptr;
            self.last_prox_ptr[level] = prox_ptr;
            if level > 0 {
                out.write_vlong(child_pointer)?;
            }
            child_pointer = out.file_pointer();
        }
        Ok(())
    }

    /// Writes the buffered levels, highest first, each prefixed with its
    /// byte length so the block is self-delimiting inside the freq file.
    /// Returns the file pointer where the skip data starts.
    pub fn write_to(&mut self, out: &mut dyn IndexOutput, doc_count: u32) -> SearchResult<u64> {
        let start = out.file_pointer();
        let num_levels = levels_for(doc_count);
        for level in (0..num_levels).rev() {
            let bytes = self.levels[level].bytes();
            out.write_vlong(bytes.len() as u64)?;
            out.write_bytes(bytes)?;
        }
        Ok(start)
    }
}

impl Default for SkipListWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded skip point: state of the postings cursors right after
/// `num_docs` documents, the last of which was `doc`.
#[derive(Clone, Copy, Debug)]
struct SkipPoint {
    doc: DocId,
    freq_ptr: u64,
    prox_ptr: u64,
    child_ptr: u64,
    /// Count of documents up to and including `doc`.
    num_docs: u32,
}

/// Reads a term's skip pyramid and answers "position me on the last skip
/// point at or before `target`".
pub struct SkipListReader {
    streams: Vec<IndexInput>,
    num_levels: usize,
}

impl SkipListReader {
    /// `input` must be positioned at the skip data start. The block is
    /// self-delimiting, so the input may extend past it.
    pub fn new(mut input: IndexInput, doc_count: u32) -> SearchResult<Self> {
        let num_levels = levels_for(doc_count);
        // levels come highest first, each length-prefixed
        let mut carved = Vec::with_capacity(num_levels);
        for _ in 0..num_levels {
            let len = input.read_vlong()?;
            carved.push(input.slice(input.name(), input.position(), len)?);
            input.seek(input.position() + len)?;
        }
        carved.reverse(); // now streams[level] is ascending by level
        Ok(Self {
            streams: carved,
            num_levels,
        })
    }

    fn points_per_entry(level: usize) -> u32 {
        SKIP_INTERVAL.pow(level as u32)
    }

    /// Finds the last skip point with `doc <= target`, descending through
    /// the levels. Returns `None` when even the first point overshoots.
    pub fn skip_to(
        &mut self,
        target: DocId,
        freq_base: u64,
        prox_base: u64,
    ) -> SearchResult<Option<(DocId, u64, u64, u32)>> {
        let mut accepted: Option<SkipPoint> = None;
        for level in (0..self.num_levels).rev() {
            // resume under the entry accepted above, or from the start
            let (mut doc, mut freq_ptr, mut prox_ptr, mut points) = match accepted {
                Some(point) => {
                    self.streams[level].seek(point.child_ptr)?;
                    (
                        point.doc,
                        point.freq_ptr,
                        point.prox_ptr,
                        point.num_docs / SKIP_INTERVAL,
                    )
                }
                None => {
                    self.streams[level].seek(0)?;
                    (0, freq_base, prox_base, 0)
                }
            };
            loop {
                let stream = &mut self.streams[level];
                if stream.position() >= stream.len() {
                    break;
                }
                let mark = stream.position();
                let next_doc = doc + stream.read_vint()? as DocId;
                if next_doc > target {
                    stream.seek(mark)?;
                    break;
                }
                doc = next_doc;
                freq_ptr += stream.read_vlong()?;
                prox_ptr += stream.read_vlong()?;
                let child_ptr = if level > 0 { stream.read_vlong()? } else { 0 };
                points += Self::points_per_entry(level);
                accepted = Some(SkipPoint {
                    doc,
                    freq_ptr,
                    prox_ptr,
                    child_ptr,
                    num_docs: points * SKIP_INTERVAL,
                });
            }
        }
        Ok(accepted.map(|p| (p.doc, p.freq_ptr, p.prox_ptr, p.num_docs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Directory, RamDirectory};

    // Builds skip data for docs 0..n with freq pointer advancing 3 bytes
    // and prox pointer 5 bytes per doc.
    fn build(n: u32) -> (SkipListReader, u32) {
        let dir = RamDirectory::new();
        let mut writer = SkipListWriter::new();
        writer.reset(0, 0);
        for count in 1..=n {
            if count % SKIP_INTERVAL == 0 {
                let doc = (count - 1) as DocId;
                writer
                    .buffer_skip(doc, count, count as u64 * 3, count as u64 * 5)
                    .unwrap();
            }
        }
        let mut out = dir.create_output("skip").unwrap();
        writer.write_to(out.as_mut(), n).unwrap();
        out.close().unwrap();
        let input = dir.open_input("skip").unwrap();
        (SkipListReader::new(input, n).unwrap(), n)
    }

    #[test]
    fn single_level_skip() {
        let (mut reader, _) = build(100);
        // target below the first skip point
        assert!(reader.skip_to(3, 0, 0).unwrap().is_none());
        // lands on the skip point at 16 docs (last doc 15)
        let (doc, freq, prox, num) = reader.skip_to(20, 0, 0).unwrap().unwrap();
        assert_eq!((doc, num), (15, 16));
        assert_eq!((freq, prox), (48, 80));
        // exact hit on a skip doc keeps that point
        let (doc, _, _, num) = reader.skip_to(95, 0, 0).unwrap().unwrap();
        assert_eq!((doc, num), (95, 96));
    }

    #[test]
    fn multi_level_skip() {
        // 16^2 * 4 docs → two levels
        let (mut reader, n) = build(1024);
        for target in [17, 255, 256, 300, 1000, 1023] {
            let (doc, freq, prox, num) = reader.skip_to(target, 0, 0).unwrap().unwrap();
            // the accepted point is the greatest multiple of 16 at or
            // before target+1
            let expected_num = ((target as u32 + 1) / SKIP_INTERVAL) * SKIP_INTERVAL;
            assert_eq!(num, expected_num.min(n), "target {target}");
            assert_eq!(doc, expected_num as DocId - 1);
            assert_eq!(freq, expected_num as u64 * 3);
            assert_eq!(prox, expected_num as u64 * 5);
        }
    }
}
