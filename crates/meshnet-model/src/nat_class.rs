/// NAT classification as derived from STUN observations (spec.md §3/§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatClass {
    Open,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
    Unknown,
}

impl NatClass {
    /// The compatibility matrix of spec.md §4.4: whether two peers in these
    /// classes are permitted to attempt a direct (hole-punched) connection.
    ///
    /// `self` is the local class, `peer` is the remote class. The matrix is
    /// symmetric in the data but spec.md defines it by row/column, so we
    /// keep the lookup row-major to match the table exactly rather than
    /// relying on an assumed symmetry.
    pub fn permits_direct_with(self, peer: NatClass) -> bool {
        use NatClass::*;

        let rank = |c: NatClass| match c {
            Open => 0,
            FullCone => 1,
            RestrictedCone => 2,
            PortRestrictedCone => 3,
            Symmetric => 4,
            Unknown => 5,
        };

        // Row i, column j of spec.md §4.4, 0-indexed open..unknown.
        const MATRIX: [[bool; 6]; 6] = [
            // open
            [true, true, true, true, true, false],
            // full-cone
            [true, true, true, true, false, false],
            // restricted
            [true, true, true, false, false, false],
            // port-restricted
            [true, true, false, false, false, false],
            // symmetric
            [true, false, false, false, false, false],
            // unknown
            [false, false, false, false, false, false],
        ];

        MATRIX[rank(self)][rank(peer)]
    }
}
