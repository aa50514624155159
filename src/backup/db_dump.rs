// projectbackup/src/backup/db_dump.rs
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use flate2::Compression;
use flate2::write::GzEncoder;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStdout, Command};

use crate::config::{ConnectionConfig, DatabaseEngine};
use crate::errors::{BackupError, Result};
use crate::reporter::Reporter;
use crate::utils::find_executable;

const STAGE: &str = "dump";

/// Stands in for the database name of engines with a single unnamed schema.
pub const SINGLE_SCHEMA_PLACEHOLDER: &str = "database";

/// The dump file produced for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpArtifact {
    pub engine: DatabaseEngine,
    pub database_name: String,
    pub path: PathBuf,
    pub compressed: bool,
}

/// `<engine>-<name>.sql[.gz]`
pub fn dump_file_name(engine: DatabaseEngine, database: &str, compressed: bool) -> String {
    let name = match engine {
        DatabaseEngine::Sqlite => SINGLE_SCHEMA_PLACEHOLDER,
        _ => database,
    };
    let extension = if compressed { "sql.gz" } else { "sql" };
    format!("{}-{}.{}", engine.tag(), name, extension)
}

/// Dumps the configured database through its vendor CLI tool.
#[derive(Debug, Clone)]
pub struct DatabaseDumper {
    connection: ConnectionConfig,
    tool: PathBuf,
    compress: bool,
}

impl DatabaseDumper {
    /// Resolves the dump tool for the connection's engine.
    pub fn new(connection: ConnectionConfig, compress: bool) -> Result<Self> {
        let tool_name = match connection.engine {
            DatabaseEngine::MySql => "mysqldump",
            DatabaseEngine::PostgreSql => "pg_dump",
            DatabaseEngine::Sqlite => "sqlite3",
        };
        let tool = find_executable(None, tool_name)?;
        Ok(Self {
            connection,
            tool,
            compress,
        })
    }

    #[cfg(test)]
    pub fn with_tool(connection: ConnectionConfig, tool: PathBuf, compress: bool) -> Self {
        Self {
            connection,
            tool,
            compress,
        }
    }

    fn command(&self) -> Command {
        let connection = &self.connection;
        let mut command = Command::new(&self.tool);
        match connection.engine {
            DatabaseEngine::MySql => {
                command.args(["--single-transaction", "--skip-lock-tables", "--quick"]);
                if let Some(host) = &connection.host {
                    command.arg("-h").arg(host);
                }
                if let Some(port) = connection.port {
                    command.arg("-P").arg(port.to_string());
                }
                if let Some(user) = &connection.username {
                    command.arg("-u").arg(user);
                }
                if let Some(password) = &connection.password {
                    command.env("MYSQL_PWD", password);
                }
                command.arg(&connection.database);
            }
            DatabaseEngine::PostgreSql => {
                command.arg("--no-password");
                if let Some(host) = &connection.host {
                    command.arg("-h").arg(host);
                }
                if let Some(port) = connection.port {
                    command.arg("-p").arg(port.to_string());
                }
                if let Some(user) = &connection.username {
                    command.arg("-U").arg(user);
                }
                if let Some(password) = &connection.password {
                    command.env("PGPASSWORD", password);
                }
                command.arg(&connection.database);
            }
            DatabaseEngine::Sqlite => {
                command.arg(&connection.database).arg(".dump");
            }
        }
        command
    }

    /// Where `dump` will write its file inside `target_dir`.
    pub fn output_path(&self, target_dir: &Path) -> PathBuf {
        target_dir.join(dump_file_name(
            self.connection.engine,
            &self.connection.database,
            self.compress,
        ))
    }

    /// Writes the dump into `target_dir`, creating the directory if needed.
    ///
    /// The tool is killed if the returned future is dropped before it exits.
    pub async fn dump(&self, target_dir: &Path, reporter: &dyn Reporter) -> Result<DumpArtifact> {
        tokio::fs::create_dir_all(target_dir).await.map_err(|e| {
            BackupError::DumpFailed(format!(
                "Failed to create dump directory {}: {}",
                target_dir.display(),
                e
            ))
        })?;

        let artifact = DumpArtifact {
            engine: self.connection.engine,
            database_name: match self.connection.engine {
                DatabaseEngine::Sqlite => SINGLE_SCHEMA_PLACEHOLDER.to_string(),
                _ => self.connection.database.clone(),
            },
            path: self.output_path(target_dir),
            compressed: self.compress,
        };

        reporter.info(
            STAGE,
            &format!(
                "Dumping {} database '{}' to {}",
                artifact.engine.tag(),
                artifact.database_name,
                artifact.path.display()
            ),
        );

        if let Err(e) = run_dump(self.command(), &artifact.path, self.compress).await {
            let _ = tokio::fs::remove_file(&artifact.path).await;
            return Err(e);
        }

        reporter.info(STAGE, &format!("✓ Database dumped to {}", artifact.path.display()));
        Ok(artifact)
    }
}

/// Streams the tool's stdout into `output_path`, through gzip when asked.
async fn run_dump(mut command: Command, output_path: &Path, compress: bool) -> Result<()> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BackupError::DumpFailed(format!("Failed to start dump tool: {}", e)))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| BackupError::DumpFailed("dump tool stdout unavailable".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| BackupError::DumpFailed("dump tool stderr unavailable".to_string()))?;

    let file = File::create(output_path).map_err(|e| {
        BackupError::DumpFailed(format!("Failed to create {}: {}", output_path.display(), e))
    })?;
    let sink = DumpSink::new(BufWriter::new(file), compress);

    let mut stderr_text = String::new();
    let (write_result, _) = tokio::join!(
        copy_output(&mut stdout, sink),
        stderr.read_to_string(&mut stderr_text)
    );
    // Closing our end unblocks a tool still writing after a failed copy.
    drop(stdout);

    let status = child
        .wait()
        .await
        .map_err(|e| BackupError::DumpFailed(format!("Failed to wait for dump tool: {}", e)))?;

    if let Err(e) = write_result {
        return Err(BackupError::DumpFailed(format!(
            "Failed to write {}: {}",
            output_path.display(),
            e
        )));
    }
    if !status.success() {
        return Err(BackupError::DumpFailed(format!(
            "dump tool exited with {}: {}",
            status,
            stderr_text.trim()
        )));
    }
    Ok(())
}

async fn copy_output(stdout: &mut ChildStdout, mut sink: DumpSink) -> io::Result<()> {
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = stdout.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        sink.write_all(&buffer[..read])?;
    }
    sink.finish()
}

/// Output file, optionally behind a gzip encoder.
enum DumpSink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl DumpSink {
    fn new(file: BufWriter<File>, compress: bool) -> Self {
        if compress {
            DumpSink::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            DumpSink::Plain(file)
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            DumpSink::Plain(file) => file.write_all(bytes),
            DumpSink::Gzip(encoder) => encoder.write_all(bytes),
        }
    }

    fn finish(self) -> io::Result<()> {
        let mut file = match self {
            DumpSink::Plain(file) => file,
            DumpSink::Gzip(encoder) => encoder.finish()?,
        };
        file.flush()?;
        file.get_ref().sync_all()
    }
}
