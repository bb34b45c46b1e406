#[derive(Debug, thiserror::Error)]
pub enum DnsbpfError {
    #[error("invalid classifier parameters: {0}")]
    InvalidParameters(String),
    #[error("bytecode too long: {count} instructions, xt_bpf accepts at most {max}")]
    ProgramTooLong { count: usize, max: usize },
    #[error("malformed bytecode: {0}")]
    MalformedBytecode(String),
    #[error("cannot assemble BPF program: {0}")]
    Assembly(String),
    #[error("template error: {0}")]
    Template(#[from] askama::Error),
    #[error("cannot write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[source] std::io::Error),
}
