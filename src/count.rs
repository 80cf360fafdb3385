//! The default fragment processor: re-parse one record and tally its graph
//! entities.
//!
//! This is the concrete collaborator the CLI runs, and a realistic stand-in for
//! heavier processors (graph construction, database loading) that share its
//! signature. It parses the fragment it owns with its own parser instance, so it is
//! safe to invoke from any number of worker threads at once.

use crate::types::{PipelineConfig, ProcessingError, RecordCounts};
use quick_xml::events::Event;
use quick_xml::Reader;

/// Counts `<node>`, `<control>` and `<pathway>` elements in one serialized record.
///
/// Unlike the outer streaming reader, a fragment handed to a processor is expected
/// to be well-formed on its own; malformed fragment XML here is a processing
/// failure, not a recoverable parse event.
pub fn count_graph_elements(
    fragment: &str,
    _config: &PipelineConfig,
) -> Result<RecordCounts, ProcessingError> {
    let mut reader = Reader::from_str(fragment);
    let mut counts = RecordCounts::default();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                match e.name().as_ref() {
                    b"node" => counts.nodes += 1,
                    b"control" => counts.controls += 1,
                    b"pathway" => counts.pathways += 1,
                    _ => {}
                }
            }
            Ok(Event::Eof) => return Ok(counts),
            Ok(_) => {}
            Err(e) => {
                return Err(ProcessingError::new(
                    format!(
                        "malformed record fragment at byte {}",
                        reader.buffer_position()
                    ),
                    e,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipelineConfig {
        PipelineConfig::default()
    }

    #[test]
    fn counts_each_category() {
        let fragment = "<resnet>\
                        <nodes><node id=\"1\"/><node id=\"2\"/></nodes>\
                        <controls><control><link/></control></controls>\
                        <pathway name=\"p\"/>\
                        </resnet>";
        let counts = count_graph_elements(fragment, &config()).expect("well-formed fragment");
        assert_eq!(counts, RecordCounts::new(2, 1, 1));
    }

    #[test]
    fn unrelated_elements_do_not_count() {
        let counts =
            count_graph_elements("<resnet><meta/><other>x</other></resnet>", &config())
                .expect("well-formed fragment");
        assert_eq!(counts, RecordCounts::default());
    }

    #[test]
    fn malformed_fragment_is_a_processing_error() {
        let err = count_graph_elements("<resnet><node></resnet>", &config());
        assert!(err.is_err());
    }
}
