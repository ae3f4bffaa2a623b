use elastic_chain_client::{ClientConfig, ElasticClient, Outcome, StaticDirectory};
use std::sync::Arc;

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} --map <file> --path <path> [--config <file>] <command> [args]",
        program
    );
    eprintln!("Commands: get <key> | exists <key> | remove <key> | num_keys");
    eprintln!("          put <key> <value> | update <key> <value> | upsert <key> <value>");
    eprintln!(
        "Example: {} --map cluster.json --path /users put alice admin",
        program
    );
    std::process::exit(1);
}

fn render(outcome: &Outcome) -> String {
    String::from_utf8_lossy(outcome.wire()).into_owned()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 6 {
        usage(&args[0]);
    }

    let mut map_file: Option<String> = None;
    let mut path: Option<String> = None;
    let mut config_file: Option<String> = None;
    let mut command: Vec<String> = vec![];

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--map" | "--path" | "--config" if i + 1 >= args.len() => usage(&args[0]),
            "--map" => {
                map_file = Some(args[i + 1].clone());
                i += 2;
            }
            "--path" => {
                path = Some(args[i + 1].clone());
                i += 2;
            }
            "--config" => {
                config_file = Some(args[i + 1].clone());
                i += 2;
            }
            _ => {
                command.push(args[i].clone());
                i += 1;
            }
        }
    }

    let (Some(map_file), Some(path)) = (map_file, path) else {
        usage(&args[0]);
    };
    let config = match config_file {
        Some(file) => ClientConfig::from_file(file)?,
        None => ClientConfig::default(),
    };

    let directory = Arc::new(StaticDirectory::from_file(&map_file)?);
    tracing::info!("Loaded partition maps from {}", map_file);

    let client = ElasticClient::new(directory.clone(), directory, config)?;
    let mut table = client.open_hash_table(&path).await?;

    let arg = |n: usize| command.get(n).map(|s| s.as_bytes());
    let output = match (command.first().map(String::as_str), arg(1), arg(2)) {
        (Some("get"), Some(key), None) => render(&table.get(key).await?),
        (Some("exists"), Some(key), None) => table.exists(key).await?.to_string(),
        (Some("remove"), Some(key), None) => render(&table.remove(key).await?),
        (Some("put"), Some(key), Some(value)) => render(&table.put(key, value).await?),
        (Some("update"), Some(key), Some(value)) => render(&table.update(key, value).await?),
        (Some("upsert"), Some(key), Some(value)) => render(&table.upsert(key, value).await?),
        (Some("num_keys"), None, None) => table.num_keys().await?.to_string(),
        _ => usage(&args[0]),
    };

    println!("{}", output);
    client.close(&path);
    Ok(())
}
