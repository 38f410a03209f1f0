use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_query::Expr;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Donations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Donations::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Donations::TransactionHash)
                            .string_len(66)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Donations::DonorAddress)
                            .string_len(42)
                            .null(),
                    )
                    .col(ColumnDef::new(Donations::DonorId).string_len(64).null())
                    .col(ColumnDef::new(Donations::DonationId).big_integer().null())
                    // uint256 wei amounts; 39 digits covers u128
                    .col(
                        ColumnDef::new(Donations::Amount)
                            .decimal_len(39, 0)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Donations::Purpose).text().not_null())
                    .col(
                        ColumnDef::new(Donations::TargetSchoolId)
                            .string_len(64)
                            .null(),
                    )
                    .col(ColumnDef::new(Donations::BlockNumber).big_integer().null())
                    .col(
                        ColumnDef::new(Donations::BlockTimestamp)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Donations::Status)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Donations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Donations::ConfirmedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Donations::AllocatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Donations::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Upsert target for the chain mirror. NULL hashes do not collide.
        manager
            .create_index(
                Index::create()
                    .name("idx_donations_transaction_hash")
                    .table(Donations::Table)
                    .col(Donations::TransactionHash)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_donations_donor_address")
                    .table(Donations::Table)
                    .col(Donations::DonorAddress)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_donations_status_created")
                    .table(Donations::Table)
                    .col(Donations::Status)
                    .col(Donations::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_donations_target_school")
                    .table(Donations::Table)
                    .col(Donations::TargetSchoolId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Donations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Donations {
    Table,
    Id,
    TransactionHash,
    DonorAddress,
    DonorId,
    DonationId,
    Amount,
    Purpose,
    TargetSchoolId,
    BlockNumber,
    BlockTimestamp,
    Status,
    CreatedAt,
    ConfirmedAt,
    AllocatedAt,
    CompletedAt,
}
