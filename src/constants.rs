//! Typed mirror of the MT5 enum space, plus the server-loaded named-constant
//! table (§3, §4.8, §10.6).
//!
//! The distilled specification only lists the retcode numbers the classifier
//! needs (§4.2); a complete façade also needs the rest of the terminal's enum
//! space to build typed requests (trade actions, order/deal/symbol kinds,
//! timeframes). These mirror the original constant groups one-for-one.

use std::collections::HashMap;

macro_rules! mt5_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum $name {
            $($variant = $value),+
        }

        impl TryFrom<i32> for $name {
            type Error = i32;

            fn try_from(value: i32) -> Result<Self, i32> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err(other),
                }
            }
        }

        impl From<$name> for i32 {
            fn from(value: $name) -> i32 {
                value as i32
            }
        }
    };
}

mt5_enum!(
    /// Trade request action type.
    TradeAction {
        Deal = 1,
        Pending = 5,
        Sltp = 6,
        Modify = 7,
        Remove = 8,
        CloseBy = 10,
    }
);

mt5_enum!(
    /// Order type.
    OrderType {
        Buy = 0,
        Sell = 1,
        BuyLimit = 2,
        SellLimit = 3,
        BuyStop = 4,
        SellStop = 5,
        BuyStopLimit = 6,
        SellStopLimit = 7,
        CloseBy = 8,
    }
);

mt5_enum!(
    /// Order filling mode.
    OrderFilling {
        Fok = 0,
        Ioc = 1,
        Return = 2,
        Boc = 3,
    }
);

mt5_enum!(
    /// Order time type.
    OrderTime {
        Gtc = 0,
        Day = 1,
        Specified = 2,
        SpecifiedDay = 3,
    }
);

mt5_enum!(
    /// Order state.
    OrderState {
        Started = 0,
        Placed = 1,
        Canceled = 2,
        Partial = 3,
        Filled = 4,
        Rejected = 5,
        Expired = 6,
        RequestAdd = 7,
        RequestModify = 8,
        RequestCancel = 9,
    }
);

mt5_enum!(
    /// Order reason.
    OrderReason {
        Client = 0,
        Mobile = 1,
        Web = 2,
        Expert = 3,
        Sl = 4,
        Tp = 5,
        So = 6,
    }
);

mt5_enum!(
    /// Position type.
    PositionType { Buy = 0, Sell = 1 }
);

mt5_enum!(
    /// Position reason.
    PositionReason {
        Client = 0,
        Mobile = 1,
        Web = 2,
        Expert = 3,
    }
);

mt5_enum!(
    /// Deal type.
    DealType {
        Buy = 0,
        Sell = 1,
        Balance = 2,
        Credit = 3,
        Charge = 4,
        Correction = 5,
        Bonus = 6,
        Commission = 7,
        CommissionDaily = 8,
        CommissionMonthly = 9,
        CommissionAgentDaily = 10,
        CommissionAgentMonthly = 11,
        Interest = 12,
        BuyCanceled = 13,
        SellCanceled = 14,
    }
);

mt5_enum!(
    /// Deal entry type.
    DealEntry {
        In = 0,
        Out = 1,
        InOut = 2,
        OutBy = 3,
    }
);

mt5_enum!(
    /// Deal reason.
    DealReason {
        Client = 0,
        Mobile = 1,
        Web = 2,
        Expert = 3,
        Sl = 4,
        Tp = 5,
        So = 6,
        Rollover = 7,
        Vmargin = 8,
        Split = 9,
    }
);

mt5_enum!(
    /// Symbol calculation mode.
    SymbolCalcMode {
        Forex = 0,
        Futures = 1,
        Cfd = 2,
        CfdIndex = 3,
        CfdLeverage = 4,
        ForexNoLeverage = 5,
        ExchStocks = 32,
        ExchFutures = 33,
        ExchOptions = 34,
        ExchOptionsMargin = 36,
        ExchBonds = 37,
        ExchStocksMoex = 38,
        ExchBondsMoex = 39,
        ServCollateral = 64,
    }
);

mt5_enum!(
    /// Symbol chart mode.
    SymbolChartMode { Bid = 0, Last = 1 }
);

mt5_enum!(
    /// Symbol trade mode.
    SymbolTradeMode {
        Disabled = 0,
        LongOnly = 1,
        ShortOnly = 2,
        CloseOnly = 3,
        Full = 4,
    }
);

mt5_enum!(
    /// Symbol trade execution mode.
    SymbolTradeExecution {
        Request = 0,
        Instant = 1,
        Market = 2,
        Exchange = 3,
    }
);

mt5_enum!(
    /// Symbol swap mode.
    SymbolSwapMode {
        Disabled = 0,
        Points = 1,
        CurrencySymbol = 2,
        CurrencyMargin = 3,
        CurrencyDeposit = 4,
        InterestCurrent = 5,
        InterestOpen = 6,
        ReopenCurrent = 7,
        ReopenBid = 8,
    }
);

mt5_enum!(
    /// Symbol option mode.
    SymbolOptionMode { European = 0, American = 1 }
);

mt5_enum!(
    /// Symbol option right.
    SymbolOptionRight { Call = 0, Put = 1 }
);

mt5_enum!(
    /// Chart timeframes.
    TimeFrame {
        M1 = 1,
        M2 = 2,
        M3 = 3,
        M4 = 4,
        M5 = 5,
        M6 = 6,
        M10 = 10,
        M12 = 12,
        M15 = 15,
        M20 = 20,
        M30 = 30,
        H1 = 16385,
        H2 = 16386,
        H3 = 16387,
        H4 = 16388,
        H6 = 16390,
        H8 = 16392,
        H12 = 16396,
        D1 = 16408,
        W1 = 32769,
        Mn1 = 49153,
    }
);

mt5_enum!(
    /// Tick flags.
    TickFlag {
        Bid = 2,
        Ask = 4,
        Last = 8,
        Volume = 16,
        Buy = 32,
        Sell = 64,
    }
);

mt5_enum!(
    /// Copy-ticks flags.
    CopyTicksFlag { All = -1, Info = 1, Trade = 2 }
);

mt5_enum!(
    /// Market depth book type.
    BookType {
        Sell = 1,
        Buy = 2,
        SellMarket = 3,
        BuyMarket = 4,
    }
);

mt5_enum!(
    /// Day of week.
    DayOfWeek {
        Sunday = 0,
        Monday = 1,
        Tuesday = 2,
        Wednesday = 3,
        Thursday = 4,
        Friday = 5,
        Saturday = 6,
    }
);

mt5_enum!(
    /// Account margin mode.
    AccountMarginMode {
        RetailNetting = 0,
        Exchange = 1,
        RetailHedging = 2,
    }
);

mt5_enum!(
    /// Account stopout mode.
    AccountStopoutMode { Percent = 0, Money = 1 }
);

mt5_enum!(
    /// Account trade mode.
    AccountTradeMode { Demo = 0, Contest = 1, Real = 2 }
);

/// The server-loaded `map<string,int>` from `get_constants` (§4.8), for
/// named constants the client-side enum mirror above does not know about.
/// Built once on connect and cached for the life of the connection.
#[derive(Debug, Clone, Default)]
pub struct RemoteConstants {
    values: HashMap<String, i32>,
}

impl RemoteConstants {
    /// Builds the table from the server's `Constants{values}` response.
    pub fn from_map(values: HashMap<String, i32>) -> Self {
        Self { values }
    }

    /// Attribute-style lookup by constant name.
    pub fn get(&self, name: &str) -> Option<i32> {
        self.values.get(name).copied()
    }

    /// Number of named constants loaded from the remote terminal.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no constants have been loaded (e.g. before connect).
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_roundtrips() {
        assert_eq!(TimeFrame::try_from(16385).unwrap(), TimeFrame::H1);
        assert_eq!(i32::from(TimeFrame::H1), 16385);
    }

    #[test]
    fn unknown_value_is_rejected() {
        assert!(TimeFrame::try_from(999_999).is_err());
    }

    #[test]
    fn remote_constants_lookup() {
        let mut map = HashMap::new();
        map.insert("TRADE_RETCODE_DONE".to_string(), 10009);
        let constants = RemoteConstants::from_map(map);
        assert_eq!(constants.get("TRADE_RETCODE_DONE"), Some(10009));
        assert_eq!(constants.get("MISSING"), None);
        assert_eq!(constants.len(), 1);
    }
}
