mod builder;
mod collab;
mod extract;
mod verify;

pub use builder::{Collaborators, RecursiveBuilder};
pub use collab::{
    AnswerSource, ArtifactSink, CommandAnalyzer, CommandTestRunner, FileArtifactSink,
    ScriptedAnswerSource, StaticAnalyzer, StdinAnswerSource, TestRunner,
};
pub use extract::{ParsedResponse, questions_and_code};
pub use verify::Verifier;
