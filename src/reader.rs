// ========================================================================================
//
//                          THE STREAMING FRAGMENT READER
//
// ========================================================================================
//
// This module is the sole authority on extracting record fragments from a large XML
// document. It pulls events off a buffered parser one at a time and re-serializes the
// events between a matching start tag and its end tag into a standalone `String`.
// Nothing outside the fragment currently being captured is ever retained: the event
// buffer is cleared after every event and a finished fragment is handed off wholesale,
// so peak memory is bounded by the size of one record regardless of document size.
//
// Malformed markup does not abort the read. A parse error outside a capture is logged
// and skipped; a parse error inside a capture abandons that fragment and resumes
// scanning. Only an I/O error (or a parser that stops making progress) ends the
// stream early. None of this recovery is counted as a task failure downstream.

use crate::types::PipelineError;
use log::{error, warn};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// An incremental reader yielding one serialized `<tag>...</tag>` fragment per
/// matching element, in document order.
///
/// The sequence is lazy, finite, and non-restartable. Occurrences of the target tag
/// nested inside a fragment stay inside that fragment; only an outermost match opens
/// a new capture.
pub struct FragmentReader<R: BufRead> {
    reader: Reader<R>,
    tag: Vec<u8>,
    /// Reusable event buffer, cleared before every read.
    buf: Vec<u8>,
    done: bool,
    /// Byte position of the last recovered parse error, used to detect a parser
    /// that is no longer advancing.
    last_error_pos: u64,
}

impl FragmentReader<BufReader<File>> {
    /// Opens a document on disk. Failure to open the file is fatal; it propagates
    /// to the caller before any fragment is produced.
    pub fn open(path: &Path, tag: &str) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|source| PipelineError::Input {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_reader(BufReader::new(file), tag))
    }
}

impl<R: BufRead> FragmentReader<R> {
    /// Wraps an already-open byte source. Used directly by tests and by callers
    /// that stream from something other than a file.
    pub fn from_reader(input: R, tag: &str) -> Self {
        Self {
            reader: Reader::from_reader(input),
            tag: tag.as_bytes().to_vec(),
            buf: Vec::new(),
            done: false,
            last_error_pos: u64::MAX,
        }
    }

    fn tag_display(&self) -> String {
        String::from_utf8_lossy(&self.tag).into_owned()
    }
}

impl<R: BufRead> Iterator for FragmentReader<R> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }

        // The fragment being captured, if any, and the element nesting depth
        // inside it. Depth counts every element, not just the target tag, so a
        // record containing nested same-named elements closes at the right spot.
        let mut capture: Option<Vec<u8>> = None;
        let mut depth = 0usize;

        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(ref e)) => {
                    if let Some(frag) = capture.as_mut() {
                        depth += 1;
                        append_start(frag, e);
                    } else if e.name().as_ref() == self.tag.as_slice() {
                        let mut frag = Vec::with_capacity(256);
                        append_start(&mut frag, e);
                        depth = 1;
                        capture = Some(frag);
                    }
                }
                Ok(Event::End(ref e)) => {
                    if let Some(frag) = capture.as_mut() {
                        append_end(frag, e);
                        depth -= 1;
                        if depth == 0 {
                            let frag = capture.take().unwrap_or_default();
                            return Some(String::from_utf8_lossy(&frag).into_owned());
                        }
                    }
                }
                Ok(Event::Empty(ref e)) => {
                    if let Some(frag) = capture.as_mut() {
                        append_empty(frag, e);
                    } else if e.name().as_ref() == self.tag.as_slice() {
                        let mut frag = Vec::with_capacity(e.len() + 3);
                        append_empty(&mut frag, e);
                        return Some(String::from_utf8_lossy(&frag).into_owned());
                    }
                }
                Ok(Event::Eof) => {
                    if capture.is_some() {
                        warn!(
                            "input ended inside an unterminated <{}> element; \
                             partial fragment discarded",
                            self.tag_display()
                        );
                    }
                    self.done = true;
                    return None;
                }
                Ok(ref event) => {
                    // Text, CDATA, comments and processing instructions are part of
                    // a fragment's content; outside a capture they are scaffolding
                    // between records and are dropped immediately.
                    if let Some(frag) = capture.as_mut() {
                        append_content(frag, event);
                    }
                }
                Err(e) => {
                    if matches!(&e, quick_xml::Error::Io(_)) {
                        error!("read error in input stream: {e}");
                        self.done = true;
                        return None;
                    }
                    let pos = self.reader.buffer_position() as u64;
                    if pos == self.last_error_pos {
                        // Recovery is only safe while the cursor advances.
                        error!("parser made no progress past byte {pos} ({e}); stopping");
                        self.done = true;
                        return None;
                    }
                    self.last_error_pos = pos;
                    if capture.take().is_some() {
                        warn!(
                            "malformed markup at byte {pos} ({e}); abandoning partial <{}> fragment",
                            self.tag_display()
                        );
                        depth = 0;
                    } else {
                        warn!("skipping malformed markup at byte {pos}: {e}");
                    }
                }
            }
        }
    }
}

// The parser hands back the raw bytes between the angle brackets of each event, so a
// fragment can be reassembled verbatim (attributes and entity escapes untouched)
// without a second serialization pass.

fn append_start(frag: &mut Vec<u8>, raw: &[u8]) {
    frag.push(b'<');
    frag.extend_from_slice(raw);
    frag.push(b'>');
}

fn append_end(frag: &mut Vec<u8>, raw: &[u8]) {
    frag.extend_from_slice(b"</");
    frag.extend_from_slice(raw);
    frag.push(b'>');
}

fn append_empty(frag: &mut Vec<u8>, raw: &[u8]) {
    frag.push(b'<');
    frag.extend_from_slice(raw);
    frag.extend_from_slice(b"/>");
}

fn append_content(frag: &mut Vec<u8>, event: &Event) {
    match event {
        Event::Text(e) => frag.extend_from_slice(e),
        Event::CData(e) => {
            frag.extend_from_slice(b"<![CDATA[");
            frag.extend_from_slice(e);
            frag.extend_from_slice(b"]]>");
        }
        Event::Comment(e) => {
            frag.extend_from_slice(b"<!--");
            frag.extend_from_slice(e);
            frag.extend_from_slice(b"-->");
        }
        Event::PI(e) => {
            frag.extend_from_slice(b"<?");
            frag.extend_from_slice(e);
            frag.extend_from_slice(b"?>");
        }
        // Declarations and DOCTYPEs cannot occur inside an element in well-formed
        // input; if the recovery path surfaces one mid-capture it is dropped.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(xml: &str, tag: &str) -> Vec<String> {
        FragmentReader::from_reader(Cursor::new(xml.to_string()), tag).collect()
    }

    #[test]
    fn yields_fragments_in_document_order() {
        let xml = "<batch>\
                   <resnet id=\"a\"><node/></resnet>\
                   <resnet id=\"b\"><node/><node/></resnet>\
                   <resnet id=\"c\"/>\
                   </batch>";
        let frags = read_all(xml, "resnet");
        assert_eq!(frags.len(), 3);
        assert_eq!(frags[0], "<resnet id=\"a\"><node/></resnet>");
        assert_eq!(frags[1], "<resnet id=\"b\"><node/><node/></resnet>");
        assert_eq!(frags[2], "<resnet id=\"c\"/>");
    }

    #[test]
    fn preserves_text_attributes_and_escapes_verbatim() {
        let xml = "<doc><rec kind=\"x&amp;y\">hello &lt;world&gt;<!-- note --></rec></doc>";
        let frags = read_all(xml, "rec");
        assert_eq!(
            frags,
            vec!["<rec kind=\"x&amp;y\">hello &lt;world&gt;<!-- note --></rec>".to_string()]
        );
    }

    #[test]
    fn nested_same_named_elements_stay_inside_one_fragment() {
        let xml = "<doc><rec><rec>inner</rec>tail</rec><rec>second</rec></doc>";
        let frags = read_all(xml, "rec");
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0], "<rec><rec>inner</rec>tail</rec>");
        assert_eq!(frags[1], "<rec>second</rec>");
    }

    #[test]
    fn ignores_non_matching_siblings() {
        let xml = "<doc><meta>x</meta><rec>a</rec><other><rec>b</rec></other></doc>";
        let frags = read_all(xml, "rec");
        // The <rec> inside <other> still matches: records are identified by tag
        // name wherever they appear, like an iterparse tag filter.
        assert_eq!(frags, vec!["<rec>a</rec>".to_string(), "<rec>b</rec>".to_string()]);
    }

    #[test]
    fn cdata_is_carried_through() {
        let xml = "<d><rec><![CDATA[1 < 2]]></rec></d>";
        let frags = read_all(xml, "rec");
        assert_eq!(frags, vec!["<rec><![CDATA[1 < 2]]></rec>".to_string()]);
    }

    #[test]
    fn empty_document_yields_nothing() {
        assert!(read_all("<doc></doc>", "rec").is_empty());
    }

    #[test]
    fn truncated_final_fragment_is_discarded() {
        let xml = "<doc><rec>ok</rec><rec>chopped";
        let frags = read_all(xml, "rec");
        assert_eq!(frags, vec!["<rec>ok</rec>".to_string()]);
    }

    #[test]
    fn missing_file_is_a_fatal_setup_error() {
        let err = FragmentReader::open(Path::new("/no/such/file.xml"), "rec");
        assert!(matches!(err, Err(PipelineError::Input { .. })));
    }

    #[test]
    fn reads_from_disk() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "<doc><rec>1</rec><rec>2</rec></doc>").expect("write");
        let reader = FragmentReader::open(file.path(), "rec").expect("open");
        let frags: Vec<String> = reader.collect();
        assert_eq!(frags, vec!["<rec>1</rec>".to_string(), "<rec>2</rec>".to_string()]);
    }
}
