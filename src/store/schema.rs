// src/store/schema.rs
use rusqlite::Connection;

/// Coupon table plus its secondary indexes.
pub const CREATE_FLIGHTS: &str = "
CREATE TABLE IF NOT EXISTS flights (
    year        INTEGER NOT NULL,
    quarter     INTEGER NOT NULL CHECK (quarter BETWEEN 1 AND 4),
    ItinID      CHAR(6) NOT NULL,
    SeqNum      INTEGER NOT NULL,
    Coupons     INTEGER NOT NULL,
    Origin      CHAR(3) NOT NULL,
    Dest        CHAR(3) NOT NULL,
    CouponType  CHAR(1) NOT NULL,
    TkCarrier   CHAR(2) NOT NULL,
    OpCarrier   CHAR(2) NOT NULL,
    RPCarrier   CHAR(2) NOT NULL,
    Passengers  REAL NOT NULL,
    PRIMARY KEY (year, quarter, ItinID, SeqNum)
);
CREATE INDEX IF NOT EXISTS idx_temporal ON flights(year, quarter);
CREATE INDEX IF NOT EXISTS idx_route ON flights(Origin, Dest);
CREATE INDEX IF NOT EXISTS idx_carriers ON flights(TkCarrier, OpCarrier);
CREATE INDEX IF NOT EXISTS idx_itin ON flights(ItinID);
";

pub const UPSERT_COUPON: &str = "
INSERT INTO flights
    (year, quarter, ItinID, SeqNum, Coupons, Origin, Dest, CouponType,
     TkCarrier, OpCarrier, RPCarrier, Passengers)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT (year, quarter, ItinID, SeqNum) DO UPDATE SET
    Coupons = excluded.Coupons,
    Origin = excluded.Origin,
    Dest = excluded.Dest,
    CouponType = excluded.CouponType,
    TkCarrier = excluded.TkCarrier,
    OpCarrier = excluded.OpCarrier,
    RPCarrier = excluded.RPCarrier,
    Passengers = excluded.Passengers
";

pub fn initialize(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_FLIGHTS)?;
    crate::history::initialize(conn)
}
