use crate::money::Amount;
use crate::params::ConsensusParams;

/// Block reward created by the coinbase at `height`, before fees.
pub fn block_subsidy(height: u32, params: &ConsensusParams) -> Amount {
    if params.subsidy_halving_interval == 0 {
        return params.initial_subsidy;
    }
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    params.initial_subsidy >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::COIN;
    use crate::params::{consensus_params, Network};

    #[test]
    fn subsidy_halves_on_schedule() {
        let params = consensus_params(Network::Mainnet);
        let interval = params.subsidy_halving_interval;
        assert_eq!(block_subsidy(0, &params), 50 * COIN);
        assert_eq!(block_subsidy(interval - 1, &params), 50 * COIN);
        assert_eq!(block_subsidy(interval, &params), 25 * COIN);
        assert_eq!(block_subsidy(interval * 2, &params), 25 * COIN / 2);
        assert_eq!(block_subsidy(interval * 64, &params), 0);
    }
}
