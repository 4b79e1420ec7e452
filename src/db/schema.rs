diesel::table! {
    fd_list (id) {
        id -> Integer,
        name -> Text,
        latitude -> Double,
        longitude -> Double,
    }
}

diesel::table! {
    measurements (id) {
        id -> Integer,
        device_id -> Integer,
        timestamp -> BigInt,
        frequency -> BigInt,
        rssi -> Integer,
    }
}

diesel::joinable!(measurements -> fd_list (device_id));

diesel::allow_tables_to_appear_in_same_query!(fd_list, measurements);

diesel::allow_columns_to_appear_in_same_group_by_clause!(
    measurements::timestamp,
    fd_list::name,
);
