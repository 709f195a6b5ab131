use std::path::PathBuf;

/// One file to push to a host before any command runs: a local source and
/// the remote directory it lands in (keeping its file name).
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub src: PathBuf,
    pub dst: String,
}

/// An ordered batch of work applied identically to every host in a
/// dispatch: uploads first, then shell commands, both in listed order.
#[derive(Debug, Clone, Default)]
pub struct Command {
    pub uploads: Vec<FileUpload>,
    pub commands: Vec<String>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(mut self, cmd: impl Into<String>) -> Self {
        self.commands.push(cmd.into());
        self
    }

    pub fn upload(mut self, src: impl Into<PathBuf>, dst: impl Into<String>) -> Self {
        self.uploads.push(FileUpload {
            src: src.into(),
            dst: dst.into(),
        });
        self
    }
}
