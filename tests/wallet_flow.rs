//! Wallet lifecycle: creation, Pix keys, deposits, withdrawals, and the
//! ledger invariants that must hold after any mix of operations.

mod common;

use chrono::Duration;
use pix_wallet_service::clock::Clock;
use sqlx::PgPool;
use uuid::Uuid;

use common::{context, funded_wallet, ledger_entry_count, ledger_sum, money};
use pix_wallet_service::error::AppError;
use pix_wallet_service::models::pix_key::PixKeyType;

#[sqlx::test]
async fn create_wallet_rejects_duplicate_user(pool: PgPool) {
    let ctx = context(pool);

    let wallet = ctx.wallets.create_wallet("alice").await.unwrap();
    assert_eq!(wallet.user_id, "alice");
    assert_eq!(wallet.balance_cents, 0);

    let duplicate = ctx.wallets.create_wallet("alice").await;
    assert!(matches!(duplicate, Err(AppError::DuplicateUser)));

    // A different user is unaffected.
    ctx.wallets.create_wallet("bob").await.unwrap();
}

#[sqlx::test]
async fn create_wallet_validates_user_id(pool: PgPool) {
    let ctx = context(pool);

    assert!(matches!(
        ctx.wallets.create_wallet("   ").await,
        Err(AppError::InvalidRequest(_))
    ));
    assert!(matches!(
        ctx.wallets.create_wallet(&"x".repeat(101)).await,
        Err(AppError::InvalidRequest(_))
    ));
}

#[sqlx::test]
async fn deposit_and_withdraw_update_balance_and_ledger(pool: PgPool) {
    let ctx = context(pool.clone());
    let wallet_id = funded_wallet(&ctx, "alice", "0.00").await;

    let after_deposit = ctx
        .wallets
        .deposit(wallet_id, money("100.00"), Some("Salary"))
        .await
        .unwrap();
    assert_eq!(after_deposit, money("100.00"));

    let after_withdraw = ctx
        .wallets
        .withdraw(wallet_id, money("30.00"), None)
        .await
        .unwrap();
    assert_eq!(after_withdraw, money("70.00"));

    assert_eq!(ledger_sum(&pool, wallet_id).await, 7_000);
    assert_eq!(ledger_entry_count(&pool, wallet_id).await, 2);

    // The DEBIT entry carries a negative signed amount.
    let debit_amount: i64 = sqlx::query_scalar(
        "SELECT amount_cents FROM ledger_entries WHERE wallet_id = $1 AND entry_type = 'DEBIT'",
    )
    .bind(wallet_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(debit_amount, -3_000);
}

#[sqlx::test]
async fn withdrawal_boundary_exact_balance_succeeds(pool: PgPool) {
    let ctx = context(pool);
    let wallet_id = funded_wallet(&ctx, "alice", "50.00").await;

    // balance == amount succeeds and leaves zero.
    let remaining = ctx
        .wallets
        .withdraw(wallet_id, money("50.00"), None)
        .await
        .unwrap();
    assert!(remaining.is_zero());

    // balance == amount - 1 fails.
    ctx.wallets
        .deposit(wallet_id, money("0.99"), None)
        .await
        .unwrap();
    let short = ctx.wallets.withdraw(wallet_id, money("1.00"), None).await;
    assert!(matches!(short, Err(AppError::InsufficientFunds)));
}

#[sqlx::test]
async fn non_positive_amounts_are_rejected(pool: PgPool) {
    let ctx = context(pool);
    let wallet_id = funded_wallet(&ctx, "alice", "10.00").await;

    assert!(matches!(
        ctx.wallets.deposit(wallet_id, money("0"), None).await,
        Err(AppError::InvalidAmount(_))
    ));
    assert!(matches!(
        ctx.wallets.withdraw(wallet_id, money("-1.00"), None).await,
        Err(AppError::InvalidAmount(_))
    ));

    // One cent is the smallest accepted amount.
    ctx.wallets
        .deposit(wallet_id, money("0.01"), None)
        .await
        .unwrap();
}

#[sqlx::test]
async fn operations_on_unknown_wallet_fail(pool: PgPool) {
    let ctx = context(pool);
    let ghost = Uuid::new_v4();

    assert!(matches!(
        ctx.wallets.deposit(ghost, money("1.00"), None).await,
        Err(AppError::WalletNotFound)
    ));
    assert!(matches!(
        ctx.wallets.balance(ghost).await,
        Err(AppError::WalletNotFound)
    ));
    assert!(matches!(
        ctx.wallets.balance_at(ghost, common::start_time()).await,
        Err(AppError::WalletNotFound)
    ));
}

#[sqlx::test]
async fn balance_always_equals_ledger_sum(pool: PgPool) {
    let ctx = context(pool.clone());
    let wallet_id = funded_wallet(&ctx, "alice", "0.00").await;

    // Mixed workload, including a rejected overdraft in the middle.
    ctx.wallets.deposit(wallet_id, money("10.00"), None).await.unwrap();
    ctx.wallets.deposit(wallet_id, money("2.50"), None).await.unwrap();
    ctx.wallets.withdraw(wallet_id, money("0.75"), None).await.unwrap();
    assert!(ctx
        .wallets
        .withdraw(wallet_id, money("999.00"), None)
        .await
        .is_err());
    ctx.wallets.deposit(wallet_id, money("0.01"), None).await.unwrap();
    ctx.wallets.withdraw(wallet_id, money("11.76"), None).await.unwrap();

    let balance = ctx.wallets.balance(wallet_id).await.unwrap();
    assert_eq!(balance.cents(), ledger_sum(&pool, wallet_id).await);
    assert_eq!(balance, money("0.00"));

    // The failed overdraft left no ledger trace.
    assert_eq!(ledger_entry_count(&pool, wallet_id).await, 5);
}

#[sqlx::test]
async fn concurrent_deposits_are_all_applied(pool: PgPool) {
    let ctx = context(pool.clone());
    let wallet_id = funded_wallet(&ctx, "alice", "0.00").await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let wallets = ctx.wallets.clone();
        handles.push(tokio::spawn(async move {
            wallets.deposit(wallet_id, money("1.00"), None).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let balance = ctx.wallets.balance(wallet_id).await.unwrap();
    assert_eq!(balance, money("10.00"));
    assert_eq!(ledger_sum(&pool, wallet_id).await, 1_000);
    assert_eq!(ledger_entry_count(&pool, wallet_id).await, 10);
}

#[sqlx::test]
async fn balance_reconstruction_replays_the_ledger(pool: PgPool) {
    let ctx = context(pool);
    let wallet_id = funded_wallet(&ctx, "alice", "0.00").await;

    let t1 = common::start_time();
    ctx.wallets.deposit(wallet_id, money("100.00"), None).await.unwrap();

    ctx.clock.advance(Duration::minutes(10));
    let t2 = ctx.clock.now();
    ctx.wallets.deposit(wallet_id, money("50.00"), None).await.unwrap();

    ctx.clock.advance(Duration::minutes(10));
    let t3 = ctx.clock.now();
    ctx.wallets.withdraw(wallet_id, money("30.00"), None).await.unwrap();

    assert_eq!(
        ctx.wallets.balance_at(wallet_id, t1).await.unwrap(),
        money("100.00")
    );
    assert_eq!(
        ctx.wallets.balance_at(wallet_id, t2).await.unwrap(),
        money("150.00")
    );
    assert_eq!(
        ctx.wallets.balance_at(wallet_id, t3).await.unwrap(),
        money("120.00")
    );
    assert_eq!(ctx.wallets.balance(wallet_id).await.unwrap(), money("120.00"));

    // A timestamp before any activity replays to zero.
    assert_eq!(
        ctx.wallets
            .balance_at(wallet_id, t1 - Duration::seconds(1))
            .await
            .unwrap(),
        money("0.00")
    );
}

#[sqlx::test]
async fn pix_key_registration_rules(pool: PgPool) {
    let ctx = context(pool);
    let wallet_id = funded_wallet(&ctx, "bob", "0.00").await;

    let key = ctx
        .wallets
        .register_pix_key(wallet_id, "b@x.com", PixKeyType::Email)
        .await
        .unwrap();
    assert!(key.is_active);
    assert_eq!(key.key_type, "EMAIL");

    // Same value and type cannot be active twice, not even on another wallet.
    let other = funded_wallet(&ctx, "carol", "0.00").await;
    assert!(matches!(
        ctx.wallets
            .register_pix_key(other, "b@x.com", PixKeyType::Email)
            .await,
        Err(AppError::InvalidRequest(_))
    ));

    // Same value under a different type is a separate key.
    ctx.wallets
        .register_pix_key(wallet_id, "+5511987654321", PixKeyType::Phone)
        .await
        .unwrap();

    assert!(matches!(
        ctx.wallets
            .register_pix_key(wallet_id, "not-an-email", PixKeyType::Email)
            .await,
        Err(AppError::InvalidRequest(_))
    ));
    assert!(matches!(
        ctx.wallets
            .register_pix_key(Uuid::new_v4(), "c@x.com", PixKeyType::Email)
            .await,
        Err(AppError::WalletNotFound)
    ));
}
