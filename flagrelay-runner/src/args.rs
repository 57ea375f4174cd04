use flagrelay_core::{ArgumentList, FlagOrder, Token};

/// Build the subprocess argv: the fixed JSON flag, then one `--token` per
/// body token in the requested order.
pub fn build_arguments(json_flag: &str, tokens: &[Token], order: FlagOrder) -> ArgumentList {
    let mut args = ArgumentList::new();
    args.push(json_flag);

    match order {
        FlagOrder::Reversed => tokens.iter().rev().for_each(|t| args.push(t.to_flag())),
        FlagOrder::Forward => tokens.iter().for_each(|t| args.push(t.to_flag())),
    }

    args
}
