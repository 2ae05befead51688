pub const SOURCE_ZIP_NAME: &str = "source.zip";
pub const NIX_SHELL_FILE_NAME: &str = "shell.nix";
pub const ENV_DUMP_FILE_NAME: &str = "env.bin";

pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Mount point of the submission directory inside an isolate box.
pub const BOX_SUBMISSION_DIR: &str = "/box/submission";
/// Mount point of the runtime script directory inside an isolate box.
pub const BOX_RUNTIME_DIR: &str = "/runtime";

pub const INTERNAL_SERVER_ERROR: &str = "Internal server error";
