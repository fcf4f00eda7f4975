//! Re-verify settled rounds from the ledger database.
//!
//! For each round: `SHA-256(reveal_seed)` must equal the stored commitment and
//! re-deriving winners from the revealed seed must reproduce the stored list.

use clap::Parser;
use stakeroom::{
    common::types::{RoundRecord, RoundStatus},
    fairness::{verify_commitment, verify_round},
    storage::{RocksStore, Store},
};

#[derive(Parser, Debug)]
#[command(name = "verify_round")]
#[command(about = "Verify commit-reveal fairness of settled rounds", long_about = None)]
struct Args {
    /// Database directory
    #[arg(long, default_value = "./DB/stakeroom_data")]
    data_dir: String,

    /// Verify a single round
    #[arg(long, conflicts_with = "room")]
    round: Option<String>,

    /// Verify every round of a room
    #[arg(long)]
    room: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let store = RocksStore::open(&args.data_dir)?;

    let rounds: Vec<RoundRecord> = match (&args.round, &args.room) {
        (Some(round_id), _) => match store.get_round(round_id).await? {
            Some(round) => vec![round],
            None => return Err(format!("round {} not found", round_id).into()),
        },
        (None, Some(room_id)) => store.rounds_for_room(room_id).await?,
        (None, None) => return Err("pass --round <id> or --room <id>".into()),
    };

    let mut checked = 0usize;
    let mut failures = 0usize;
    for round in &rounds {
        if round.status != RoundStatus::Settled {
            println!("   - round {} #{} is {}, skipped", round.round_id, round.round_number, round.status);
            continue;
        }
        checked += 1;

        let Some(room) = store.get_room(&round.room_id).await? else {
            println!("   ❌ round {}: room {} missing", round.round_id, round.room_id);
            failures += 1;
            continue;
        };

        let commitment_ok = round
            .reveal_seed
            .as_deref()
            .map(|seed| verify_commitment(seed, &round.commit_hash))
            .transpose()?
            .unwrap_or(false);
        let winners_ok = verify_round(round, room.winner_count)?;

        if commitment_ok && winners_ok {
            println!(
                "   ✅ round {} #{}: commitment {}... winners {:?}",
                round.round_id,
                round.round_number,
                short_hash(&round.commit_hash),
                round.winners.as_deref().unwrap_or_default()
            );
        } else {
            failures += 1;
            println!(
                "   ❌ round {} #{}: commitment {} winners {}",
                round.round_id,
                round.round_number,
                if commitment_ok { "ok" } else { "MISMATCH" },
                if winners_ok { "ok" } else { "MISMATCH" }
            );
        }
    }

    println!("\n📊 Verification Summary:");
    println!("   Rounds checked: {}", checked);
    println!("   Failures: {}", failures);

    if failures > 0 {
        return Err(format!("{} round(s) failed verification", failures).into());
    }
    Ok(())
}

/// First 16 characters of a stored hash; never splits a multi-byte char
fn short_hash(hash: &str) -> String {
    hash.chars().take(16).collect()
}
