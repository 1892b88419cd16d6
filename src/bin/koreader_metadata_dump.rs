use anyhow::{Context, Result};
use clap::Parser;
use koreader_sync::koreader;
use koreader_sync::model::BookRecord;
use koreader_sync::source::SourceFile;
use serde::Serialize;
use std::path::Path;

#[derive(Parser)]
#[command(name = "koreader_metadata_dump")]
#[command(about = "Print the book record read from a KOReader metadata file")]
struct Cli {
    metadata_path: String,
    #[arg(short, long)]
    pretty: bool,
}

#[derive(Debug, Serialize)]
struct Dump {
    filename: String,
    identity: Option<String>,
    book: Option<BookRecord>,
}

fn dump_metadata(path: &Path) -> Result<Dump> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read metadata: {}", path.display()))?;
    let source = SourceFile::new(path.to_path_buf());

    let book = koreader::parse(&text)
        .with_context(|| format!("Failed to parse metadata: {}", path.display()))?
        .map(|mut book| {
            if book.title.trim().is_empty() {
                if let Some(title) = source.fallback_title {
                    book.title = title;
                }
            }
            book
        });

    Ok(Dump {
        filename: path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string(),
        identity: book.as_ref().map(BookRecord::identity),
        book,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = Path::new(&cli.metadata_path);

    if !path.exists() {
        anyhow::bail!("File does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("Path is not a file: {}", path.display());
    }

    let dump = dump_metadata(path)?;

    if cli.pretty {
        println!("{}", serde_json::to_string_pretty(&dump)?);
    } else {
        println!("{}", serde_json::to_string(&dump)?);
    }

    Ok(())
}
