mod detect;
mod extractor;
mod gate;
mod parser;
mod parsers;
mod resolver;

pub use detect::{detect_format, SNIFF_WINDOW};
pub use extractor::{
    extract_fragments, ExtractedEntity, ExtractionError, ExtractionPattern, ExtractionResult,
    ExtractionRun, ExtractionStrategy, Extractor, HttpExtractor, RuleBasedExtractor,
    SEED_TERM_BOOST,
};
pub use gate::{
    GateError, GateOutcome, GateResult, Upload, ValidationError, ValidationGate, CHUNK_SIZE,
};
pub use parser::{DocumentFormat, ParseError, ParseResult, Parser, ParserRegistry};
pub use parsers::{OfficeParser, ProcessModelParser, StructuredParser, TextParser};
pub use resolver::{
    normalize_name, DuplicateCandidate, EntityResolver, Resolution, ResolvedEntity,
    SimilarityReason,
};
