use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Semantic memory over exported chat conversations", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the memory from a conversations export (JSON array).
    Train {
        /// Path to the conversations file
        #[clap(short, long)]
        input: PathBuf,

        /// Embedding strategy: full, messages or chunks.
        /// Defaults to embedding.strategy from config.yaml
        #[clap(short, long)]
        strategy: Option<String>,

        /// Ignore cached embeddings and embed everything again
        #[clap(long, default_value = "false")]
        rebuild: bool,
    },
    /// Find stored conversation segments similar to a text
    Query {
        /// Query text
        #[clap(allow_hyphen_values = true)]
        text: String,

        /// Number of results. Defaults to retrieval.default_k
        #[clap(short)]
        k: Option<usize>,

        /// Include similarity scores
        #[clap(long, default_value = "false")]
        scores: bool,

        /// Return at most one result per conversation
        #[clap(short, long, default_value = "false")]
        conversations: bool,
    },
    /// Show memory statistics
    Stats {},
    /// Remove every row from the memory
    Clear {},
    /// Remove all cached embeddings
    CacheClear {},
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_train() {
        let args = Args::try_parse_from([
            "chatmem", "train", "--input", "export.json", "--strategy", "messages", "--rebuild",
        ])
        .unwrap();

        match args.command {
            Command::Train {
                input,
                strategy,
                rebuild,
            } => {
                assert_eq!(input, PathBuf::from("export.json"));
                assert_eq!(strategy.as_deref(), Some("messages"));
                assert!(rebuild);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_query() {
        let args =
            Args::try_parse_from(["chatmem", "query", "debug help", "-k", "3", "--conversations"]).unwrap();

        match args.command {
            Command::Query {
                text,
                k,
                scores,
                conversations,
            } => {
                assert_eq!(text, "debug help");
                assert_eq!(k, Some(3));
                assert!(!scores);
                assert!(conversations);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_cache_clear() {
        let args = Args::try_parse_from(["chatmem", "cache-clear"]).unwrap();
        assert!(matches!(args.command, Command::CacheClear {}));
    }
}
