use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP daemon
    Serve {
        /// Listen address, overrides `server.listen`
        #[clap(short, long)]
        listen: Option<String>,
    },

    /// Run the full pipeline for one question and print the event stream
    Ask {
        question: String,
    },

    /// Load the vector index, rebuilding it when sources changed
    Index {
        /// Rebuild even if the persisted index is fresh
        #[clap(short, long, default_value = "false")]
        force: bool,
    },

    /// Search the knowledge base and print the hits as JSON
    Search {
        query: String,

        /// Number of results
        #[clap(short, default_value_t = crate::retrieval::DEFAULT_TOP_K)]
        k: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let args = Args::parse_from(["querybot", "search", "rate limit", "-k", "3"]);
        assert!(matches!(args.command, Command::Search { ref query, k: 3 } if query == "rate limit"));

        let args = Args::parse_from(["querybot", "index", "--force"]);
        assert!(matches!(args.command, Command::Index { force: true }));

        let args = Args::parse_from(["querybot", "serve"]);
        assert!(matches!(args.command, Command::Serve { listen: None }));
    }
}
