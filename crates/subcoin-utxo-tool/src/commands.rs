use crate::utxo_csv::read_utxos;
use crate::{Error, Result};
use bitcoin::BlockHash;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use subcoin_utxo_commitment::{
    CommitmentLoader, CommitmentParams, DEFAULT_IMPORT_BATCH_SIZE, JsonManifestStore,
    ManifestStore, UtxoCommitment, UtxoCommitmentBuilder,
};
use subcoin_utxo_storage::{MemoryStore, RocksDbStore, UtxoWorkingSet, WorkingSetOptions};

/// Directory under the output directory holding the manifests.
pub(crate) const MANIFEST_DIR: &str = "manifests";

#[derive(Debug, clap::Args)]
pub struct BuildCmd {
    /// UTXO dump, one `txid:vout,is_coinbase,height,amount,script_pubkey_hex` per line.
    #[arg(long)]
    pub utxos: PathBuf,

    /// Hash of the block the dump was taken at.
    #[arg(long)]
    pub block_hash: BlockHash,

    /// Height of the block the dump was taken at.
    #[arg(long)]
    pub height: u32,

    /// Directory receiving the payload files, manifests go to its `manifests` subdirectory.
    #[arg(long)]
    pub output: PathBuf,

    /// JSON file with the commitment parameters.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Overrides `maxSubBucketBytes` of the config.
    #[arg(long)]
    pub max_sub_bucket_bytes: Option<u64>,

    /// Overrides `workerCount` of the config.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Prune older manifests in the output directory, keeping this many.
    #[arg(long)]
    pub keep: Option<usize>,
}

impl BuildCmd {
    fn params(&self) -> Result<CommitmentParams> {
        let mut params = match &self.config {
            Some(path) => serde_json::from_reader(BufReader::new(File::open(path)?))?,
            None => CommitmentParams::default(),
        };
        if let Some(max_sub_bucket_bytes) = self.max_sub_bucket_bytes {
            params.max_sub_bucket_bytes = max_sub_bucket_bytes;
        }
        if let Some(workers) = self.workers {
            params.worker_count = workers;
        }
        if params.max_sub_bucket_bytes == 0 || params.worker_count == 0 {
            return Err(Error::Input(
                "maxSubBucketBytes and workerCount must be positive".to_string(),
            ));
        }
        Ok(params)
    }

    pub fn run(self) -> Result<()> {
        let commitment = self.execute()?;
        println!("Block:       #{},{}", commitment.block_height, commitment.block_hash);
        println!("Hash:        {}", hex::encode(commitment.hash));
        println!("Public key:  {}", hex::encode(commitment.public_key));
        println!("UTXOs:       {}", commitment.utxo_count());
        println!("Bytes:       {}", commitment.byte_count);
        println!("Files:       {}", commitment.file_names().count());
        Ok(())
    }

    pub(crate) fn execute(&self) -> Result<UtxoCommitment> {
        let params = self.params()?;
        let entries = read_utxos(BufReader::new(File::open(&self.utxos)?))?;
        tracing::info!("Loaded {} UTXOs from {}", entries.len(), self.utxos.display());

        std::fs::create_dir_all(&self.output)?;
        let manifest_store = JsonManifestStore::open(self.output.join(MANIFEST_DIR))?;

        // The dump is loaded as the durable part of an empty working set.
        let working_set = UtxoWorkingSet::new(
            Arc::new(MemoryStore::with_entries(entries)),
            WorkingSetOptions::default(),
        );
        let snapshot = working_set.snapshot()?;

        let builder = UtxoCommitmentBuilder::new(&self.output, params);
        let commitment =
            builder.build_and_store(&manifest_store, self.block_hash, self.height, &snapshot)?;

        if let Some(keep) = self.keep {
            let pruned = manifest_store.prune(keep, &self.output)?;
            for block_hash in pruned {
                tracing::info!("Pruned UTXO commitment {block_hash}");
            }
        }

        Ok(commitment)
    }
}

#[derive(Debug, clap::Args)]
pub struct VerifyCmd {
    /// Manifest file.
    #[arg(long)]
    pub manifest: PathBuf,

    /// Directory containing the payload files.
    #[arg(long)]
    pub dir: PathBuf,

    /// Import the verified UTXOs into the RocksDB database at this path.
    #[arg(long)]
    pub import: Option<PathBuf>,
}

impl VerifyCmd {
    pub fn run(self) -> Result<()> {
        let commitment = JsonManifestStore::read_manifest(&self.manifest)?;
        let loader = CommitmentLoader::new(&self.dir);

        match &self.import {
            Some(db_path) => {
                let imported = import(&loader, &commitment, db_path)?;
                println!("Imported {imported} UTXOs into {}", db_path.display());
            }
            None => {
                loader.verify(&commitment)?;
            }
        }

        println!(
            "UTXO commitment #{},{} is valid: {}",
            commitment.block_height,
            commitment.block_hash,
            hex::encode(commitment.hash)
        );

        Ok(())
    }
}

fn import(loader: &CommitmentLoader, commitment: &UtxoCommitment, db_path: &Path) -> Result<u64> {
    let store = RocksDbStore::open(db_path)?;
    Ok(loader.import(commitment, &store, DEFAULT_IMPORT_BATCH_SIZE)?)
}

#[derive(Debug, clap::Args)]
pub struct HashCmd {
    /// Payload file.
    #[arg(long)]
    pub file: PathBuf,
}

impl HashCmd {
    pub fn run(self) -> Result<()> {
        let summary = CommitmentLoader::summarize_file(&self.file)?;
        println!("Hash:        {}", hex::encode(summary.multiset.hash()));
        println!("Public key:  {}", hex::encode(summary.multiset.public_key()));
        println!("UTXOs:       {}", summary.utxo_count);
        println!("Bytes:       {}", summary.byte_count);
        println!("Sorted:      {}", summary.is_sorted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DUMP: &str = "\
0e3e2357e806b6cdb1f70b54c3a3a17b6714ee1f0e68bebb44a74b1efd512098:0,true,1,5000000000,410496b538e853519c726a2c91e61ec11600ae1390813a627c66fb8be7947be63c52da7589379515d4e0a604f8141781e62294721166bf621e73a82cbf2342c858eeac
9b0fc92260312ce44e74ef369f5c66bbb85848f2eddd5a7a1cde251e54ccfdd5:0,true,2,5000000000,41047211a824f55b505228e4c3d5194c1fcfaa15a456abdf37f9b9d97a4040afc073dee6c89064984f03385237d92167c13e236446b417ab79a0fcae412ae3316b77ac
999e1c837c76a1b7fbb7e57baf87b309960f5ffefbf2a9b95dd890602272f644:0,true,3,5000000000,410494b9d3e76c5b1629ecf97fff95d7a4bbdac87cc26099ada28066c6ff1eb9191223cd897194a08d0c2726c5747f1db49e8cf90e75dc3e3550ae9b30086f3cd5aaac
";

    fn build_cmd(dir: &Path, max_sub_bucket_bytes: u64) -> BuildCmd {
        let utxos = dir.join("utxos.csv");
        File::create(&utxos)
            .unwrap()
            .write_all(DUMP.as_bytes())
            .unwrap();

        BuildCmd {
            utxos,
            block_hash: "000000006a625f06636b8bb6ac7b960a8d03705d1ace08b1a19da3fdcc99ddbd"
                .parse()
                .unwrap(),
            height: 3,
            output: dir.join("out"),
            config: None,
            max_sub_bucket_bytes: Some(max_sub_bucket_bytes),
            workers: Some(2),
            keep: Some(1),
        }
    }

    #[test]
    fn test_build_then_verify() {
        let tmp = tempfile::tempdir().unwrap();
        let cmd = build_cmd(tmp.path(), 1024);
        let commitment = cmd.execute().unwrap();
        assert_eq!(commitment.utxo_count(), 3);

        let manifest = cmd
            .output
            .join(MANIFEST_DIR)
            .join(format!("{}.json", commitment.block_hash));
        VerifyCmd {
            manifest: manifest.clone(),
            dir: cmd.output.clone(),
            import: None,
        }
        .run()
        .unwrap();

        let db_path = tmp.path().join("db");
        let loader = CommitmentLoader::new(&cmd.output);
        let stored = JsonManifestStore::read_manifest(&manifest).unwrap();
        assert_eq!(stored, commitment);
        assert_eq!(import(&loader, &stored, &db_path).unwrap(), 3);
    }

    #[test]
    fn test_config_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let config = tmp.path().join("params.json");
        std::fs::write(&config, r#"{"maxSubBucketBytes": 4096, "workerCount": 3}"#).unwrap();

        let mut cmd = build_cmd(tmp.path(), 1024);
        cmd.config = Some(config);
        cmd.workers = None;
        let params = cmd.params().unwrap();
        assert_eq!(params.max_sub_bucket_bytes, 1024);
        assert_eq!(params.worker_count, 3);

        cmd.max_sub_bucket_bytes = Some(0);
        assert!(matches!(cmd.params(), Err(Error::Input(_))));
    }
}
