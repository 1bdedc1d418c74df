use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{VaultError, VaultResult};
use crate::spell::{SpellDocument, SpellMetadata};
use crate::types::{Spell, Utxo};

/// Parameters for one proving run
#[derive(Debug)]
pub struct ProveRequest<'a> {
    pub document: &'a SpellDocument,
    pub funding_utxo: &'a Utxo,
    pub change_address: &'a str,
    pub fee_rate: f64,
    pub previous_transactions: Vec<Vec<u8>>,
    pub temporary_secret: &'a [u8; 32],
}

/// The external prover that turns a transition description into a
/// commitment/spell transaction pair, and reads metadata back out of
/// committed transactions.
#[async_trait]
pub trait SpellProver: Send + Sync {
    async fn prove_spell(&self, request: &ProveRequest<'_>) -> VaultResult<Spell>;

    async fn show_spell(
        &self,
        tx_hex: &str,
        previous_transactions: &[Vec<u8>],
    ) -> VaultResult<SpellMetadata>;

    async fn verification_key(&self) -> VaultResult<String>;
}

/// Subprocess-based prover invoking the `charms` binary
pub struct CharmsProver {
    charms_bin: String,
    zkapp_bin: String,
    mock_proof: bool,
}

impl CharmsProver {
    pub fn new(charms_bin: String, zkapp_bin: String, mock_proof: bool) -> Self {
        Self {
            charms_bin,
            zkapp_bin,
            mock_proof,
        }
    }

    async fn run(&self, args: &[String], stdin: Option<String>) -> VaultResult<String> {
        info!("Executing: {} {}", self.charms_bin, args.join(" "));
        let mut command = Command::new(&self.charms_bin);
        command
            .args(args)
            .env("RUST_BACKTRACE", "full")
            .env("USE_MOCK_PROOF", if self.mock_proof { "true" } else { "false" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| VaultError::prover(format!("failed to spawn prover: {e}")))?;

        if let Some(input) = stdin {
            debug!("Prover stdin: {input}");
            let mut handle = child
                .stdin
                .take()
                .ok_or_else(|| VaultError::prover("prover stdin unavailable"))?;
            handle.write_all(input.as_bytes()).await?;
            drop(handle);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| VaultError::prover(format!("prover did not finish: {e}")))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            debug!("Prover stderr: {stderr}");
        }
        if !output.status.success() {
            return Err(VaultError::prover(format!(
                "prover exited with {}: {stderr}",
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SpellProver for CharmsProver {
    async fn prove_spell(&self, request: &ProveRequest<'_>) -> VaultResult<Spell> {
        let mut args = vec![
            "spell".to_string(),
            "prove".to_string(),
            "--app-bins".to_string(),
            self.zkapp_bin.clone(),
            "--funding-utxo".to_string(),
            request.funding_utxo.utxo_id(),
            "--funding-utxo-value".to_string(),
            request.funding_utxo.value.unwrap_or(0).to_string(),
            "--change-address".to_string(),
            request.change_address.to_string(),
            "--fee-rate".to_string(),
            request.fee_rate.to_string(),
            "--temporary-secret-str".to_string(),
            hex::encode(request.temporary_secret),
        ];
        if !request.previous_transactions.is_empty() {
            args.push("--prev-txs".to_string());
            args.push(
                request
                    .previous_transactions
                    .iter()
                    .map(hex::encode)
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }

        let document = serde_json::to_string(request.document)?;
        let stdout = self.run(&args, Some(document)).await?;
        parse_prove_output(&stdout)
    }

    async fn show_spell(
        &self,
        tx_hex: &str,
        previous_transactions: &[Vec<u8>],
    ) -> VaultResult<SpellMetadata> {
        let mut args = vec![
            "tx".to_string(),
            "show-spell".to_string(),
            "--tx".to_string(),
            tx_hex.to_string(),
            "--json".to_string(),
        ];
        if !previous_transactions.is_empty() {
            args.push("--prev-txs".to_string());
            args.push(
                previous_transactions
                    .iter()
                    .map(hex::encode)
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        let stdout = self.run(&args, None).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| VaultError::prover(format!("malformed show-spell output: {e}")))
    }

    async fn verification_key(&self) -> VaultResult<String> {
        let stdout = self
            .run(&["app".to_string(), "vk".to_string()], None)
            .await?;
        let vk = stdout.trim().to_string();
        if vk.is_empty() {
            return Err(VaultError::prover("empty verification key"));
        }
        Ok(vk)
    }
}

/// The prover prints progress lines before the result; the final non-empty
/// line is a JSON array of exactly two hex transactions.
fn parse_prove_output(stdout: &str) -> VaultResult<Spell> {
    let last = stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .next_back()
        .ok_or_else(|| VaultError::prover("empty prover output"))?;
    let txs: Vec<String> = serde_json::from_str(last)
        .map_err(|e| VaultError::prover(format!("malformed prover output: {e}")))?;
    if txs.len() != 2 {
        return Err(VaultError::prover(format!(
            "expected exactly two transactions, got {}",
            txs.len()
        )));
    }
    let mut decoded = txs.iter().map(|t| {
        hex::decode(t).map_err(|e| VaultError::prover(format!("invalid transaction hex: {e}")))
    });
    Ok(Spell {
        commitment_tx_bytes: decoded.next().transpose()?.unwrap_or_default(),
        spell_tx_bytes: decoded.next().transpose()?.unwrap_or_default(),
    })
}
