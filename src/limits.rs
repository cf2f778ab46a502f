/// Max rooms per tenant.
pub const MAX_ROOMS_PER_TENANT: usize = 10_000;

/// Max users per tenant.
pub const MAX_USERS_PER_TENANT: usize = 100_000;

/// Max stored bookings (any status) per room.
pub const MAX_BOOKINGS_PER_ROOM: usize = 100_000;

/// Max distinct dates in a single booking request.
pub const MAX_DATES_PER_REQUEST: usize = 31;

/// Max length of room names, user names and email addresses.
pub const MAX_NAME_LEN: usize = 256;

/// Max length of a cancellation reason.
pub const MAX_REASON_LEN: usize = 500;

/// Max length of the maintenance message.
pub const MAX_MESSAGE_LEN: usize = 1_000;

/// Max tenants (loaded engines) per server.
pub const MAX_TENANTS: usize = 1_000;

pub const MAX_TENANT_NAME_LEN: usize = 256;
