use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;

use ociarc::credentials::{Credential, StaticStore};
use ociarc::ocidist;
use ociarc::pull;
use ociarc::reference::Reference;

#[derive(Deserialize)]
struct AuthEntry {
    username: String,
    password: String,
}

type StoredAuth = BTreeMap<String, AuthEntry>;

fn load_stored_auth(p: impl AsRef<Path>) -> StaticStore {
    let stored: StoredAuth = serde_json::from_str(&std::fs::read_to_string(p).unwrap()).unwrap();
    StaticStore::new(
        stored
            .into_iter()
            .map(|(k, v)| (k, Credential::Basic(v.username, v.password))),
    )
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    image_ref: String,

    /// bypass the ref/manifest/index caches for this invocation
    #[arg(long)]
    no_cache: bool,

    /// write the index blob to this path (forces a full pull)
    #[arg(long)]
    index_out: Option<PathBuf>,

    /// print the raw manifest json instead of the summary
    #[arg(long)]
    json: bool,

    #[arg(long)]
    anonymous: bool,

    /// talk plain http, for local registries
    #[arg(long)]
    allow_http: bool,

    /// cache root, otherwise OCIARC_CACHE or ~/.local/share/ociarc
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

fn cache_dir(args: &Args) -> PathBuf {
    if let Some(dir) = &args.cache_dir {
        return dir.clone();
    }
    if let Ok(dir) = std::env::var("OCIARC_CACHE") {
        return PathBuf::from(dir);
    }
    Path::new(&std::env::var("HOME").unwrap()).join(".local/share/ociarc")
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let args = Args::parse();
    let image_ref: Reference = args.image_ref.parse().unwrap();

    let mut transport = ocidist::Client::builder()
        .anonymous(args.anonymous)
        .allow_http(args.allow_http);
    if let Ok(auth_file) = std::env::var("OCIARC_AUTH") {
        transport = transport.credentials(Arc::new(load_stored_auth(auth_file)));
    }

    let client = pull::Client::builder()
        .dir(cache_dir(&args))
        .transport(transport.build().unwrap())
        .default_block_cache()
        .build()
        .unwrap();

    if let Some(index_out) = args.index_out {
        let archive = client.pull(&image_ref, args.no_cache).await.unwrap();
        std::fs::write(&index_out, archive.index_bytes()).unwrap();
        let manifest = archive.manifest();
        println!("digest: {}", manifest.digest());
        println!(
            "wrote {} index bytes to {:?}, data blob is {} bytes",
            archive.index_bytes().len(),
            index_out,
            manifest.data_descriptor().size()
        );
    } else {
        let manifest = client.fetch(&image_ref, args.no_cache).await.unwrap();
        if args.json {
            println!(
                "{}",
                serde_json::to_string_pretty(manifest.raw()).unwrap()
            );
        } else {
            println!("digest: {}", manifest.digest());
            println!(
                "index: {} ({} bytes)",
                manifest.index_descriptor().digest(),
                manifest.index_descriptor().size()
            );
            println!(
                "data: {} ({} bytes)",
                manifest.data_descriptor().digest(),
                manifest.data_descriptor().size()
            );
            if let Some(created) = manifest.created() {
                println!("created: {}", created.to_rfc3339());
            }
        }
    }

    println!("{:#?}", client.stats());
}
