//! `genesis_escrow`: trustless artifact trades.
//!
//! Control of a listed artifact moves via `metadata.authorized_writer`,
//! never `created_by`. The escrow is itself a principal: sellers hand it
//! writable control at listing time, buyers pay it, and it pays the seller
//! and hands the buyer control. Every step is an ordinary permission-checked
//! facade call; the escrow holds no special powers, only custody.

use serde::{Deserialize, Serialize};

use super::{req_str, req_u64, unknown_method, ESCROW_LISTINGS_ARTIFACT, GENESIS_ESCROW};
use crate::artifact::META_AUTHORIZED_WRITER;
use crate::error::{KernelError, KernelResult};
use crate::kernel::{Kernel, KernelActions};
use crate::types::{ArtifactId, PrincipalId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(super) struct Listing {
    pub id: String,
    pub seller: PrincipalId,
    pub artifact_id: ArtifactId,
    pub price: u64,
}

pub(super) fn dispatch(
    kernel: &mut Kernel,
    caller: &str,
    method: &str,
    args: &serde_json::Value,
) -> KernelResult<serde_json::Value> {
    match method {
        "list" => {
            let artifact_id = req_str(args, "artifact_id")?.to_string();
            let price = req_u64(args, "price")?;
            list(kernel, caller, &artifact_id, price)
        }
        "purchase" => {
            let listing_id = req_str(args, "listing_id")?.to_string();
            purchase(kernel, caller, &listing_id)
        }
        "cancel" => {
            let listing_id = req_str(args, "listing_id")?.to_string();
            cancel(kernel, caller, &listing_id)
        }
        "listings" => Ok(serde_json::json!(load_listings(kernel)?)),
        other => Err(unknown_method(GENESIS_ESCROW, other)),
    }
}

fn list(
    kernel: &mut Kernel,
    caller: &str,
    artifact_id: &str,
    price: u64,
) -> KernelResult<serde_json::Value> {
    let target = kernel.store().get_required(artifact_id)?;
    if target.kernel_protected {
        return Err(KernelError::Validation(format!(
            "{} is kernel-protected and cannot be traded",
            artifact_id
        )));
    }
    if target.authorized_writer() != caller {
        return Err(KernelError::Permission {
            principal: caller.to_string(),
            artifact: artifact_id.to_string(),
            reason: "only the current controller may list an artifact".into(),
        });
    }
    let mut listings = load_listings(kernel)?;
    if listings.iter().any(|l| l.artifact_id == artifact_id) {
        return Err(KernelError::Validation(format!(
            "{} is already listed",
            artifact_id
        )));
    }

    // The seller hands the escrow writable control; this passes the
    // artifact's own contract because the seller is the current controller.
    kernel.update_artifact_metadata(
        caller,
        artifact_id,
        [(
            META_AUTHORIZED_WRITER.to_string(),
            serde_json::json!(GENESIS_ESCROW),
        )]
        .into_iter()
        .collect(),
    )?;

    let listing = Listing {
        id: format!("listing-{}", uuid::Uuid::new_v4()),
        seller: caller.to_string(),
        artifact_id: artifact_id.to_string(),
        price,
    };
    listings.push(listing.clone());
    save_listings(kernel, &listings)?;
    Ok(serde_json::json!({ "listing_id": listing.id, "price": price }))
}

fn purchase(
    kernel: &mut Kernel,
    caller: &str,
    listing_id: &str,
) -> KernelResult<serde_json::Value> {
    let mut listings = load_listings(kernel)?;
    let idx = find_listing(&listings, listing_id)?;
    let listing = listings[idx].clone();
    if listing.seller == caller {
        return Err(KernelError::Validation(
            "sellers cannot purchase their own listing".into(),
        ));
    }
    // Funds are checked up front so the control swap never happens without
    // payment settling.
    let available = kernel.ledger().balance(caller)?;
    if available < listing.price {
        return Err(KernelError::InsufficientFunds {
            principal: caller.to_string(),
            needed: listing.price,
            available,
        });
    }

    kernel.transfer_scrip(caller, GENESIS_ESCROW, listing.price, "escrow_purchase")?;
    kernel.transfer_scrip(GENESIS_ESCROW, &listing.seller, listing.price, "escrow_payout")?;
    kernel.update_artifact_metadata(
        GENESIS_ESCROW,
        &listing.artifact_id,
        [(
            META_AUTHORIZED_WRITER.to_string(),
            serde_json::json!(caller),
        )]
        .into_iter()
        .collect(),
    )?;

    listings.remove(idx);
    save_listings(kernel, &listings)?;
    Ok(serde_json::json!({
        "artifact_id": listing.artifact_id,
        "price": listing.price,
        "seller": listing.seller,
        "buyer": caller,
    }))
}

fn cancel(
    kernel: &mut Kernel,
    caller: &str,
    listing_id: &str,
) -> KernelResult<serde_json::Value> {
    let mut listings = load_listings(kernel)?;
    let idx = find_listing(&listings, listing_id)?;
    if listings[idx].seller != caller {
        return Err(KernelError::Permission {
            principal: caller.to_string(),
            artifact: listing_id.to_string(),
            reason: "only the seller may cancel a listing".into(),
        });
    }
    let listing = listings.remove(idx);
    kernel.update_artifact_metadata(
        GENESIS_ESCROW,
        &listing.artifact_id,
        [(
            META_AUTHORIZED_WRITER.to_string(),
            serde_json::json!(listing.seller),
        )]
        .into_iter()
        .collect(),
    )?;
    save_listings(kernel, &listings)?;
    Ok(serde_json::json!({ "cancelled": listing.id, "artifact_id": listing.artifact_id }))
}

fn find_listing(listings: &[Listing], listing_id: &str) -> KernelResult<usize> {
    listings
        .iter()
        .position(|l| l.id == listing_id)
        .ok_or_else(|| KernelError::NotFound(format!("listing {}", listing_id)))
}

pub(super) fn load_listings(kernel: &Kernel) -> KernelResult<Vec<Listing>> {
    let artifact = kernel.store().get_required(ESCROW_LISTINGS_ARTIFACT)?;
    serde_json::from_str(&artifact.content)
        .map_err(|e| KernelError::System(format!("malformed escrow listings: {}", e)))
}

fn save_listings(kernel: &mut Kernel, listings: &[Listing]) -> KernelResult<()> {
    let rendered = serde_json::to_string(listings)
        .map_err(|e| KernelError::System(format!("listings serialize: {}", e)))?;
    // Ordinary write as the escrow principal; the listings artifact is
    // escrow-owned, so this passes its contract like any other write.
    kernel
        .write_existing(
            GENESIS_ESCROW,
            ESCROW_LISTINGS_ARTIFACT,
            Some(rendered),
            None,
            None,
            None,
            None,
            None,
        )
        .map(|_| ())
}
